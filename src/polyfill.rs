//! Strict-provenance methods for `NonNull`, for toolchains that predate them.
//!
//! With the `sptr` feature, raw pointers get `addr`/`with_addr` from
//! `sptr::Strict` and `NonNull` gets them from [`NonNullStrict`]. Without it,
//! the inherent methods provided by `core` are used and this module is empty.

#[cfg(feature = "sptr")]
pub use self::strict::*;

#[cfg(feature = "sptr")]
mod strict {
    use core::{num::NonZeroUsize, ptr::NonNull};

    pub use sptr::Strict;

    pub trait NonNullStrict<T> {
        fn addr(self) -> NonZeroUsize
        where
            T: Sized;

        fn with_addr(self, addr: NonZeroUsize) -> Self
        where
            T: Sized;
    }

    impl<T> NonNullStrict<T> for NonNull<T> {
        fn addr(self) -> NonZeroUsize
        where
            T: Sized,
        {
            // SAFETY: The pointer is guaranteed by the type to be non-null,
            // meaning that the address will be non-zero.
            unsafe { NonZeroUsize::new_unchecked(self.as_ptr().addr()) }
        }

        fn with_addr(self, addr: NonZeroUsize) -> Self
        where
            T: Sized,
        {
            // SAFETY: The result of `with_addr` is non-null because `addr` is
            // guaranteed to be non-zero.
            unsafe { NonNull::new_unchecked(self.as_ptr().with_addr(addr.get())) }
        }
    }
}

#[cfg(all(test, feature = "sptr"))]
mod tests {
    use core::ptr::NonNull;

    use super::NonNullStrict;

    #[test]
    fn with_addr_round_trips_through_addr() {
        let mut word = 0u64;
        let ptr = NonNull::from(&mut word).cast::<u8>();

        let addr = NonNullStrict::addr(ptr);
        assert_eq!(addr.get(), ptr.as_ptr() as usize);
        assert_eq!(NonNullStrict::with_addr(ptr, addr), ptr);
    }
}
