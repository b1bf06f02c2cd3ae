//! Bounded exponential backoff for transient I/O errors (§4.8, §7).

use std::time::Duration;

use anyhow::Error;

/// Retry `attempt` up to `retries` times total, doubling `base_delay` after
/// each failure. Returns the last error if every attempt fails.
pub fn retry_with_backoff<T, F>(retries: u32, base_delay: Duration, mut attempt: F) -> Result<T, Error>
where
    F: FnMut(u32) -> Result<T, Error>,
{
    let mut delay = base_delay;
    let mut last_err = None;

    for try_no in 0..retries {
        match attempt(try_no) {
            Ok(value) => return Ok(value),
            Err(err) => {
                log::debug!("attempt {} failed: {}", try_no + 1, err);
                last_err = Some(err);
                if try_no + 1 < retries {
                    std::thread::sleep(delay);
                    delay *= 2;
                }
            }
        }
    }

    Err(last_err.expect("retries must be > 0"))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn succeeds_after_transient_failures() {
        let calls = Cell::new(0);
        let result: Result<i32, Error> = retry_with_backoff(3, Duration::from_millis(1), |_| {
            let n = calls.get() + 1;
            calls.set(n);
            if n < 3 {
                anyhow::bail!("transient");
            }
            Ok(42)
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn surfaces_error_after_exhausting_retries() {
        let result: Result<i32, Error> =
            retry_with_backoff(3, Duration::from_millis(1), |_| anyhow::bail!("persistent"));
        assert!(result.is_err());
    }
}
