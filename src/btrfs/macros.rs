/// Builds an ioctl request code from direction, magic, number and size.
/// Directions: 0 none, 1 write, 2 read, 3 read-write.
#[macro_export]
macro_rules! ioc {
    ($dir:expr, $magic:expr, $nr:expr, $size:expr) => {
        (($dir as u64) << 30)
            | (($size as u64) << 16)
            | (($magic as u64) << 8)
            | ($nr as u64)
    };
}

/// ioctl request code: the kernel reads the argument.
#[macro_export]
macro_rules! iow {
    ($magic:expr, $nr:expr, $ty:ty) => {
        $crate::ioc!(1, $magic, $nr, std::mem::size_of::<$ty>())
    };
}

/// ioctl request code: the kernel fills the argument in.
#[macro_export]
macro_rules! ior {
    ($magic:expr, $nr:expr, $ty:ty) => {
        $crate::ioc!(2, $magic, $nr, std::mem::size_of::<$ty>())
    };
}

/// ioctl request code: the argument is read and written.
#[macro_export]
macro_rules! iowr {
    ($magic:expr, $nr:expr, $ty:ty) => {
        $crate::ioc!(3, $magic, $nr, std::mem::size_of::<$ty>())
    };
}
