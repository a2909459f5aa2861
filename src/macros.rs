#![allow(unused_macros)]

/// Helper macro for reading locked context frames
///
/// Poisoned locks surface as [`crate::Error::LockError`] instead of panicking.
///
/// ```rust, ignore
///  let frame = read_lock!(self.frame);
///  println!("{}", frame.registers.len());
/// ```
macro_rules! read_lock {
    ($arc_rwlock:expr) => {
        $arc_rwlock.read().map_err(|_| crate::Error::LockError)?
    };
}

/// Helper macro for writing to locked context frames
///
/// ```rust, ignore
///  let mut frame = write_lock!(self.frame);
///  frame.result = None;
/// ```
macro_rules! write_lock {
    ($arc_rwlock:expr) => {
        $arc_rwlock.write().map_err(|_| crate::Error::LockError)?
    };
}

/// Helper macro for reading a locked frame inside a closure
///
/// ```rust, ignore
///  let count = with_read!(self.frame, |frame: &Frame| frame.reads.len());
/// ```
macro_rules! with_read {
    ($arc_rwlock:expr, $closure:expr) => {{
        let guard = read_lock!($arc_rwlock);
        $closure(&*guard)
    }};
}

/// Helper macro for writing to a locked frame inside a closure
///
/// ```rust, ignore
///  with_write!(self.frame, |frame: &mut Frame| frame.reads.clear());
/// ```
macro_rules! with_write {
    ($arc_rwlock:expr, $closure:expr) => {{
        let mut guard = write_lock!($arc_rwlock);
        $closure(&mut *guard)
    }};
}
