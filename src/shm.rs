// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named cross-process shared-memory segments.
//
// A segment carries a trailing process-shared atomic reference counter
// appended past the user-visible size; the last unmapper unlinks the
// backing object (POSIX). Opening an existing segment discovers its size
// from the kernel (fstat / VirtualQuery), so a subscriber can map a
// segment whose geometry it learns only from the mapped header.

use std::io;
use std::sync::atomic::{AtomicI32, Ordering};

/// Open mode for shared memory segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentMode {
    /// Create exclusively — fail if already exists.
    Create,
    /// Open existing — fail if it does not exist. Size is discovered
    /// from the kernel; the `size` argument is ignored.
    Open,
    /// Create if missing, open if it already exists.
    CreateOrOpen,
}

// ---------------------------------------------------------------------------
// Layout helpers — user region rounded up, then one trailing AtomicI32.
// ---------------------------------------------------------------------------

const ALIGN: usize = std::mem::align_of::<AtomicI32>();

fn total_size(user_size: usize) -> usize {
    let aligned = ((user_size.wrapping_sub(1) / ALIGN) + 1) * ALIGN;
    aligned + std::mem::size_of::<AtomicI32>()
}

/// The trailing reference counter of a mapped region of `total` bytes.
///
/// # Safety
/// `mem` must point to a valid mapped region of at least `total` bytes.
unsafe fn ref_counter(mem: *mut u8, total: usize) -> &'static AtomicI32 {
    let offset = total - std::mem::size_of::<AtomicI32>();
    &*(mem.add(offset) as *const AtomicI32)
}

// ---------------------------------------------------------------------------
// Name mangling — POSIX shm names want a leading '/', and macOS caps them
// at PSHMNAMLEN (31). Longer names keep a readable prefix plus an FNV-1a
// hash of the full name.
// ---------------------------------------------------------------------------

fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(target_os = "macos")]
const SHM_NAME_MAX: usize = 31;

#[cfg(not(target_os = "macos"))]
const SHM_NAME_MAX: usize = 0; // 0 = no truncation

fn make_platform_name(name: &str) -> String {
    let full = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };

    if SHM_NAME_MAX == 0 || full.len() <= SHM_NAME_MAX {
        return full;
    }

    // 1 (underscore) + 16 (hex hash)
    const HASH_SUFFIX_LEN: usize = 17;
    let prefix_len = SHM_NAME_MAX.saturating_sub(HASH_SUFFIX_LEN + 1);

    let hash = fnv1a_64(full.as_bytes());
    let mut out = String::with_capacity(SHM_NAME_MAX);
    out.push('/');
    let body = &full[1..];
    out.push_str(&body[..prefix_len.min(body.len())]);
    out.push('_');
    for shift in (0..16).rev() {
        let nibble = ((hash >> (shift * 4)) & 0xf) as usize;
        out.push(b"0123456789abcdef"[nibble] as char);
    }
    out
}

// ---------------------------------------------------------------------------
// Segment — public handle
// ---------------------------------------------------------------------------

/// A named, reference-counted, inter-process shared memory region.
pub struct Segment {
    inner: imp::Mapping,
}

impl Segment {
    /// Acquire a named segment of `size` user-visible bytes.
    ///
    /// In `Open` mode `size` is ignored and the actual object size is
    /// discovered from the kernel.
    pub fn acquire(name: &str, size: usize, mode: SegmentMode) -> io::Result<Self> {
        let inner = imp::Mapping::acquire(name, size, mode)?;
        Ok(Self { inner })
    }

    /// Pointer to the start of the user-visible region.
    pub fn as_ptr(&self) -> *const u8 {
        self.inner.mem()
    }

    /// Mutable pointer to the start of the user-visible region.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.inner.mem()
    }

    /// Size of the user-visible region.
    pub fn user_size(&self) -> usize {
        self.inner.user_size()
    }

    /// Total mapped size (including the trailing ref counter).
    pub fn mapped_size(&self) -> usize {
        self.inner.total()
    }

    /// Whether this handle was the first to map the segment.
    /// The creating side is responsible for initialising the contents
    /// (fresh segments are zero-filled by the kernel).
    pub fn created(&self) -> bool {
        self.inner.prev_ref() == 0
    }

    /// Current reference count across all processes mapping the segment.
    pub fn ref_count(&self) -> i32 {
        unsafe { ref_counter(self.inner.mem(), self.inner.total()).load(Ordering::Acquire) }
    }

    /// Remove the backing object for a named segment without an open handle.
    pub fn unlink_by_name(name: &str) {
        imp::unlink_by_name(name);
    }
}

// ---------------------------------------------------------------------------
// POSIX implementation
// ---------------------------------------------------------------------------

#[cfg(unix)]
mod imp {
    use super::*;
    use std::ffi::CString;
    use std::ptr;

    pub(super) struct Mapping {
        mem: *mut u8,
        total: usize,
        user_size: usize,
        name: String, // platform name, with leading '/'
        prev_ref: i32,
    }

    // Safety: the region is process-shared by design; all interior
    // mutability goes through atomics or caller-synchronised layouts.
    unsafe impl Send for Mapping {}
    unsafe impl Sync for Mapping {}

    impl Mapping {
        pub(super) fn acquire(name: &str, size: usize, mode: SegmentMode) -> io::Result<Self> {
            if name.is_empty() {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
            }
            if size == 0 && mode != SegmentMode::Open {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
            }

            let platform_name = make_platform_name(name);
            let c_name = CString::new(platform_name.as_bytes())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

            let perms: libc::mode_t = 0o666;

            // Exclusive-create first for CreateOrOpen so ftruncate only runs
            // on the side that actually owns the fresh object.
            let (fd, need_truncate) = match mode {
                SegmentMode::Create => {
                    let f = unsafe {
                        libc::shm_open(
                            c_name.as_ptr(),
                            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                            perms as libc::c_uint,
                        )
                    };
                    if f == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    (f, true)
                }
                SegmentMode::Open => {
                    let f = unsafe {
                        libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint)
                    };
                    if f == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    (f, false)
                }
                SegmentMode::CreateOrOpen => {
                    let f = unsafe {
                        libc::shm_open(
                            c_name.as_ptr(),
                            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                            perms as libc::c_uint,
                        )
                    };
                    if f != -1 {
                        (f, true)
                    } else {
                        let e = io::Error::last_os_error();
                        if e.raw_os_error() != Some(libc::EEXIST) {
                            return Err(e);
                        }
                        let f2 = unsafe {
                            libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint)
                        };
                        if f2 == -1 {
                            return Err(io::Error::last_os_error());
                        }
                        (f2, false)
                    }
                }
            };

            unsafe { libc::fchmod(fd, perms) };

            let total = if need_truncate {
                let total = total_size(size);
                let ret = unsafe { libc::ftruncate(fd, total as libc::off_t) };
                if ret != 0 {
                    let err = io::Error::last_os_error();
                    unsafe { libc::close(fd) };
                    return Err(err);
                }
                total
            } else {
                // Existing object: take the size the creator set.
                let mut st: libc::stat = unsafe { std::mem::zeroed() };
                if unsafe { libc::fstat(fd, &mut st) } != 0 {
                    let err = io::Error::last_os_error();
                    unsafe { libc::close(fd) };
                    return Err(err);
                }
                let total = st.st_size as usize;
                if total < std::mem::size_of::<AtomicI32>() {
                    unsafe { libc::close(fd) };
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "segment too small",
                    ));
                }
                total
            };

            let mem = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    total,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    fd,
                    0,
                )
            };
            unsafe { libc::close(fd) };
            if mem == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            let mem = mem as *mut u8;

            let prev_ref = unsafe { ref_counter(mem, total).fetch_add(1, Ordering::AcqRel) };

            Ok(Self {
                mem,
                total,
                user_size: total - std::mem::size_of::<AtomicI32>(),
                name: platform_name,
                prev_ref,
            })
        }

        pub(super) fn mem(&self) -> *mut u8 {
            self.mem
        }

        pub(super) fn total(&self) -> usize {
            self.total
        }

        pub(super) fn user_size(&self) -> usize {
            self.user_size
        }

        pub(super) fn prev_ref(&self) -> i32 {
            self.prev_ref
        }
    }

    impl Drop for Mapping {
        fn drop(&mut self) {
            if self.mem.is_null() {
                return;
            }
            let prev = unsafe { ref_counter(self.mem, self.total).fetch_sub(1, Ordering::AcqRel) };
            unsafe { libc::munmap(self.mem as *mut libc::c_void, self.total) };
            if prev <= 1 {
                if let Ok(c_name) = CString::new(self.name.as_bytes()) {
                    unsafe { libc::shm_unlink(c_name.as_ptr()) };
                }
            }
        }
    }

    pub(super) fn unlink_by_name(name: &str) {
        let platform_name = make_platform_name(name);
        if let Ok(c_name) = CString::new(platform_name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

// ---------------------------------------------------------------------------
// Windows implementation — pagefile-backed file mappings. Size discovery
// for Open mode uses VirtualQuery on the mapped view.
// ---------------------------------------------------------------------------

#[cfg(windows)]
mod imp {
    use super::*;
    use std::ptr;

    fn to_wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    pub(super) struct Mapping {
        handle: windows_sys::Win32::Foundation::HANDLE,
        mem: *mut u8,
        total: usize,
        user_size: usize,
        prev_ref: i32,
    }

    unsafe impl Send for Mapping {}
    unsafe impl Sync for Mapping {}

    impl Mapping {
        pub(super) fn acquire(name: &str, size: usize, mode: SegmentMode) -> io::Result<Self> {
            use windows_sys::Win32::Foundation::*;
            use windows_sys::Win32::System::Memory::*;

            if name.is_empty() {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
            }
            if size == 0 && mode != SegmentMode::Open {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
            }

            let wide_name = to_wide(&make_platform_name(name)[1..]);

            let (handle, known_total) = if mode == SegmentMode::Open {
                let h =
                    unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS, FALSE, wide_name.as_ptr()) };
                if h == 0 {
                    return Err(io::Error::last_os_error());
                }
                (h, 0usize)
            } else {
                let total = total_size(size);
                let h = unsafe {
                    CreateFileMappingW(
                        INVALID_HANDLE_VALUE,
                        ptr::null(),
                        PAGE_READWRITE | SEC_COMMIT,
                        0,
                        total as u32,
                        wide_name.as_ptr(),
                    )
                };
                let err = unsafe { GetLastError() };
                if mode == SegmentMode::Create && err == ERROR_ALREADY_EXISTS {
                    if h != 0 {
                        unsafe { CloseHandle(h) };
                    }
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        "segment already exists",
                    ));
                }
                if h == 0 {
                    return Err(io::Error::last_os_error());
                }
                (h, total)
            };

            let mem = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, 0) };
            if mem.is_null() {
                let e = io::Error::last_os_error();
                unsafe { CloseHandle(handle) };
                return Err(e);
            }

            let total = if known_total == 0 {
                let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
                let ret = unsafe {
                    VirtualQuery(
                        mem as *const _,
                        &mut info,
                        std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
                    )
                };
                if ret == 0 {
                    let e = io::Error::last_os_error();
                    unsafe {
                        UnmapViewOfFile(mem);
                        CloseHandle(handle);
                    }
                    return Err(e);
                }
                info.RegionSize
            } else {
                known_total
            };

            let mem = mem as *mut u8;
            let prev_ref = unsafe { ref_counter(mem, total).fetch_add(1, Ordering::AcqRel) };

            Ok(Self {
                handle,
                mem,
                total,
                user_size: total - std::mem::size_of::<AtomicI32>(),
                prev_ref,
            })
        }

        pub(super) fn mem(&self) -> *mut u8 {
            self.mem
        }

        pub(super) fn total(&self) -> usize {
            self.total
        }

        pub(super) fn user_size(&self) -> usize {
            self.user_size
        }

        pub(super) fn prev_ref(&self) -> i32 {
            self.prev_ref
        }
    }

    impl Drop for Mapping {
        fn drop(&mut self) {
            use windows_sys::Win32::Foundation::CloseHandle;
            use windows_sys::Win32::System::Memory::UnmapViewOfFile;

            if !self.mem.is_null() {
                unsafe { ref_counter(self.mem, self.total).fetch_sub(1, Ordering::AcqRel) };
                unsafe { UnmapViewOfFile(self.mem as *const _) };
            }
            if self.handle != 0 {
                unsafe { CloseHandle(self.handle) };
            }
        }
    }

    pub(super) fn unlink_by_name(_name: &str) {
        // Pagefile-backed mappings vanish with their last handle.
    }
}
