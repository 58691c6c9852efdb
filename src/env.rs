//! Environment variables

use crate::pool::scratch;
use crate::status::Status;

/// The value of `name`, or `None` when unset.
pub fn get(name: &str) -> Option<String> {
    if name.is_empty() || name.contains('=') || name.contains('\0') {
        return None;
    }
    scratch::with(|_| std::env::var(name).ok())
}

/// Set `name` to `value` in this process's environment.
pub fn set(name: &str, value: &str) -> Result<(), Status> {
    if name.is_empty() || name.contains('=') || name.contains('\0') {
        return Err(Status::invalid("bad environment variable name"));
    }
    scratch::with(|_| {
        // SAFETY: mutating the environment is unsynchronized with respect to
        // concurrent getenv in other threads; callers own that exposure, as
        // with setenv(3) itself.
        unsafe { std::env::set_var(name, value) };
        Ok(())
    })
}

/// Remove `name` from this process's environment.
pub fn delete(name: &str) -> Result<(), Status> {
    if name.is_empty() || name.contains('=') || name.contains('\0') {
        return Err(Status::invalid("bad environment variable name"));
    }
    scratch::with(|_| {
        // SAFETY: see `set`.
        unsafe { std::env::remove_var(name) };
        Ok(())
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_get_delete_cycle() {
        let name = "PORTOS_ENV_PROBE";
        assert_eq!(get(name), None);
        set(name, "alpha").unwrap();
        assert_eq!(get(name).as_deref(), Some("alpha"));
        set(name, "beta").unwrap();
        assert_eq!(get(name).as_deref(), Some("beta"));
        delete(name).unwrap();
        assert_eq!(get(name), None);
    }

    #[test]
    fn bad_names_are_rejected() {
        assert!(set("", "x").is_err());
        assert!(set("A=B", "x").is_err());
        assert!(delete("A=B").is_err());
    }
}
