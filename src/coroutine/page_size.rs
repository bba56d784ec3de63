use lazy_static::lazy_static;

lazy_static! {
    static ref PAGE_SIZE: usize = {
        let rc = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if rc <= 0 {
            panic!("sysconf(_SC_PAGESIZE) failed with errno {}", errno::errno());
        }
        rc as usize
    };
}

/// Page size of this host, always a non zero power of two.
pub fn get() -> usize {
    *PAGE_SIZE
}

/// Rounds `size` up to a multiple of page size, `None` on overflow.
pub fn align_up(size: usize) -> Option<usize> {
    let mask = get() - 1;
    size.checked_add(mask).map(|size| size & !mask)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::{assert_eq, assert_ne};

    #[test]
    fn page_size() {
        let n = super::get();
        assert_ne!(n, 0);
        assert_eq!(n & (n - 1), 0);
    }

    #[test]
    fn align_up() {
        let n = super::get();
        assert_eq!(super::align_up(0), Some(0));
        assert_eq!(super::align_up(1), Some(n));
        assert_eq!(super::align_up(n), Some(n));
        assert_eq!(super::align_up(n + 1), Some(2 * n));
        assert_eq!(super::align_up(usize::MAX), None);
    }
}
