//! Page manager.
//!
//! Every pool-owned slab is backed by an anonymous `memfd_create` file
//! rather than a plain `MAP_ANONYMOUS` region: a second,
//! independently-protectable mapping of the *same physical frames* as a
//! `MAP_ANONYMOUS` region does not exist on Linux (there is no handle to
//! re-`mmap`). Backing every slab with a memfd gives exactly that handle —
//! `remap_object` is a second `mmap(MAP_SHARED, fd, offset)` of the same
//! file, aliasing the same pages, independently `mprotect`-able.

use crate::error::SetupError;
use std::collections::BTreeMap;
use std::os::unix::io::RawFd;

pub const PAGE_SIZE: usize = 4096;

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(-1)
}

struct Mapping {
    fd: RawFd,
    len: usize,
}

lazy_static::lazy_static! {
    // canonical base address -> backing mapping. Looked up by `remap_object`
    // and cleaned up by `free_page`. Mutation only happens from ordinary
    // (non-signal) context, so a plain mutex is fine here.
    static ref MAPPINGS: crate::sync::Mutex<BTreeMap<usize, Mapping>> =
        crate::sync::Mutex::new(BTreeMap::new());
}

/// Reserves `n` zero-filled, page-aligned, `memfd`-backed pages and returns
/// their canonical base address. Out-of-memory here is not recoverable:
/// the caller aborts rather than propagating a value that
/// instrumented-program code would have to check.
pub fn alloc_n_pages(n: usize) -> usize {
    assert!(n > 0);
    let len = n * PAGE_SIZE;
    let name = std::ffi::CString::new("memsentry-slab").unwrap();
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        abort_oom("memfd_create", errno());
    }
    if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
        abort_oom("ftruncate", errno());
    }
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        abort_oom("mmap", errno());
    }
    let base = addr as usize;
    MAPPINGS.lock().insert(base, Mapping { fd, len });
    base
}

pub fn alloc_page() -> usize {
    alloc_n_pages(1)
}

/// Releases the canonical mapping at `base` (which must be a base address
/// previously returned by `alloc_page`/`alloc_n_pages`). Any shadow mapping
/// created by `remap_object` against the same backing file is left intact —
/// shadow pages are never recycled.
pub fn free_page(base: usize) {
    let mapping = MAPPINGS.lock().remove(&base);
    if let Some(m) = mapping {
        unsafe {
            libc::munmap(base as *mut libc::c_void, m.len);
            libc::close(m.fd);
        }
    }
}

/// A second mapping of the same physical frames as some canonical range,
/// independently protectable.
#[derive(Debug, Clone, Copy)]
pub struct Shadow {
    pub addr: usize,
    pub len: usize,
}

/// Maps a new, independent view of the pages backing `[canon, canon+len)`.
/// `canon` must fall within a range previously returned by
/// `alloc_page`/`alloc_n_pages`.
pub fn remap_object(canon: usize, len: usize) -> Result<Shadow, SetupError> {
    let mappings = MAPPINGS.lock();
    let (&base, m) = mappings
        .range(..=canon)
        .next_back()
        .filter(|(&base, m)| canon < base + m.len)
        .expect("remap_object: canon address not inside any page-manager allocation");
    let page_off = (canon - base) & !(PAGE_SIZE - 1);
    let intra = canon - base - page_off;
    let map_len = round_up(intra + len, PAGE_SIZE);
    let fd = m.fd;
    drop(mappings);

    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            map_len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            page_off as libc::off_t,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(SetupError::Mmap { what: "remap_object shadow", errno: errno() });
    }
    Ok(Shadow { addr: addr as usize + intra, len })
}

/// Marks every page overlapping `[addr, addr+len)` inaccessible. Accesses
/// through pointers into that range subsequently raise `SIGSEGV`/`SIGBUS`.
pub fn protect_shadow(addr: usize, len: usize) -> Result<(), SetupError> {
    mprotect_range(addr, len, libc::PROT_NONE)
}

pub fn unprotect_shadow(addr: usize, len: usize) -> Result<(), SetupError> {
    mprotect_range(addr, len, libc::PROT_READ | libc::PROT_WRITE)
}

fn mprotect_range(addr: usize, len: usize, prot: libc::c_int) -> Result<(), SetupError> {
    let page_base = addr & !(PAGE_SIZE - 1);
    let span = round_up(addr - page_base + len, PAGE_SIZE);
    let rc = unsafe { libc::mprotect(page_base as *mut libc::c_void, span, prot) };
    if rc != 0 {
        return Err(SetupError::Mprotect { addr: page_base, len: span, errno: errno() });
    }
    Ok(())
}

fn round_up(n: usize, to: usize) -> usize {
    (n + to - 1) & !(to - 1)
}

fn abort_oom(what: &str, errno: i32) -> ! {
    log::error!("page manager: {} failed, errno {}", what, errno);
    std::process::abort()
}
