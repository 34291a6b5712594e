//! Process titles shown by `ps` and `top`.

/// Title of the master process.
#[must_use]
pub fn master_title(prefix: &str, start_file: &str) -> String {
    format!("{prefix} master process, start file ({start_file})")
}

/// Title of a worker process.
#[must_use]
pub fn worker_title(prefix: &str) -> String {
    format!("{prefix} worker process")
}

/// Set the calling process's name. Cosmetic: failures are ignored.
///
/// Linux keeps at most 15 bytes of it.
#[cfg(target_os = "linux")]
pub fn set(title: &str) {
    let mut name = [0u8; 16];
    let bytes = title.as_bytes();
    let len = bytes.len().min(name.len() - 1);
    name[..len].copy_from_slice(&bytes[..len]);
    // SAFETY: `name` is NUL-terminated and outlives the call.
    let ret = unsafe { libc::prctl(libc::PR_SET_NAME, name.as_ptr() as libc::c_ulong, 0, 0, 0) };
    if ret == -1 {
        tracing::debug!(title, "cannot set process title");
    }
}

/// Set the calling process's name. No-op on this platform.
#[cfg(not(target_os = "linux"))]
pub fn set(_title: &str) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_titles() {
        assert_eq!(
            master_title("wspool", "/srv/echo"),
            "wspool master process, start file (/srv/echo)"
        );
        assert_eq!(worker_title("wspool"), "wspool worker process");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_set_on_thread() {
        // PR_SET_NAME applies to the calling thread only.
        std::thread::spawn(|| {
            set("wspool worker process");
            let comm = std::fs::read_to_string("/proc/thread-self/comm").unwrap();
            assert_eq!(comm.trim_end(), "wspool worker p");
        })
        .join()
        .unwrap();
    }
}
