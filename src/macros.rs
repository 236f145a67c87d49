#![allow(unused_macros)]

// Every structure guarded by these locks is left consistent before its guard drops, so a
// poisoned lock is recovered instead of propagating a panic into the embedding runtime.

/// Helper macro for locking items
///
/// ```rust, ignore
///  let mut data = lock!(my_mutex);
///  data.some_field = 42;
/// ```
macro_rules! lock {
    ($lock:expr) => {
        $lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    };
}

/// Helper macro for reading locked items
///
/// ```rust, ignore
///  let data = read_lock!(my_rwlock);
///  println!("{}", data.some_field);
/// ```
macro_rules! read_lock {
    ($rwlock:expr) => {
        $rwlock
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    };
}

/// Helper macro for writing to locked items
///
/// ```rust, ignore
///  let mut data = write_lock!(my_rwlock);
///  data.some_field = 42;
/// ```
macro_rules! write_lock {
    ($rwlock:expr) => {
        $rwlock
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    };
}

/// Helper macro for a timed condition variable wait on a guard obtained with `lock!`
///
/// ```rust, ignore
///  let (guard, timed_out) = wait_timeout!(self.cond, guard, remaining);
/// ```
macro_rules! wait_timeout {
    ($cond:expr, $guard:expr, $timeout:expr) => {{
        let (guard, result) = $cond
            .wait_timeout($guard, $timeout)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        (guard, result.timed_out())
    }};
}

/// Helper macro for an untimed condition variable wait on a guard obtained with `lock!`
///
/// ```rust, ignore
///  guard = wait!(self.cond, guard);
/// ```
macro_rules! wait {
    ($cond:expr, $guard:expr) => {
        $cond
            .wait($guard)
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    };
}
