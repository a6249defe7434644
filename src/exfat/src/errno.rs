// Only the errors this crate can produce are listed here. The values are the same as FreeBSD.
use std::error::Error;
use std::num::NonZeroI32;

macro_rules! error_numbers {
    ($($name:ident($num:expr) => $desc:literal,)*) => {
        $(
            pub const $name: NonZeroI32 = match NonZeroI32::new($num) {
                Some(v) => v,
                None => panic!("errno cannot be zero"),
            };
        )*

        /// Get human readable text.
        pub fn strerror(num: NonZeroI32) -> &'static str {
            match num {
                $( $name => $desc, )*
                _ => "unknown error",
            }
        }
    };
}

error_numbers! {
    ENOENT(2) => "no such file or directory",
    EIO(5) => "input/output error",
    ENOTDIR(20) => "not a directory",
    EINVAL(22) => "invalid argument",
    EFBIG(27) => "file too large",
    ENOSPC(28) => "no space left on device",
    EINTEGRITY(97) => "integrity check failed",
}

/// An object that is mappable to errno.
pub trait Errno: Error {
    fn errno(&self) -> NonZeroI32;
}
