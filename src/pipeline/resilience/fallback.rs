/// Value produced by [`run_with_fallback`], tagged with the path taken.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackOutcome<T> {
    pub value: T,
    pub used_fallback: bool,
}

/// Run `primary`; on any failure log it and run `fallback` instead.
///
/// The fallback's own error (if any) is what the caller sees.
pub fn run_with_fallback<T, E, P, F>(
    operation: &str,
    primary: P,
    fallback: F,
) -> Result<FallbackOutcome<T>, E>
where
    P: FnOnce() -> Result<T, E>,
    F: FnOnce() -> Result<T, E>,
    E: std::fmt::Display,
{
    run_with_fallback_when(operation, primary, |_| true, fallback)
}

/// Like [`run_with_fallback`], but only errors accepted by `degradable` take
/// the fallback path. Any other error from `primary` is returned as is.
pub fn run_with_fallback_when<T, E, P, D, F>(
    operation: &str,
    primary: P,
    degradable: D,
    fallback: F,
) -> Result<FallbackOutcome<T>, E>
where
    P: FnOnce() -> Result<T, E>,
    D: FnOnce(&E) -> bool,
    F: FnOnce() -> Result<T, E>,
    E: std::fmt::Display,
{
    let err = match primary() {
        Ok(value) => {
            return Ok(FallbackOutcome {
                value,
                used_fallback: false,
            })
        }
        Err(err) => err,
    };
    if !degradable(&err) {
        tracing::debug!(operation, error = %err, "Primary path failed, not degradable");
        return Err(err);
    }

    tracing::warn!(operation, error = %err, "Primary path failed, using fallback");
    fallback().map(|value| FallbackOutcome {
        value,
        used_fallback: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_success_skips_fallback() {
        let mut fallback_ran = false;
        let outcome: FallbackOutcome<u32> = run_with_fallback(
            "embed",
            || Ok::<_, String>(1),
            || {
                fallback_ran = true;
                Ok(2)
            },
        )
        .unwrap();
        assert_eq!(outcome.value, 1);
        assert!(!outcome.used_fallback);
        assert!(!fallback_ran);
    }

    #[test]
    fn primary_failure_uses_fallback() {
        let outcome = run_with_fallback(
            "embed",
            || Err::<Vec<f32>, _>("model down".to_string()),
            || Ok(Vec::new()),
        )
        .unwrap();
        assert!(outcome.used_fallback);
        assert!(outcome.value.is_empty());
    }

    #[test]
    fn fallback_error_is_surfaced() {
        let result = run_with_fallback(
            "embed",
            || Err::<(), _>("primary".to_string()),
            || Err("fallback".to_string()),
        );
        assert_eq!(result.unwrap_err(), "fallback");
    }

    #[test]
    fn non_degradable_error_skips_fallback() {
        let mut fallback_ran = false;
        let result = run_with_fallback_when(
            "embed",
            || Err::<u32, _>("dimension mismatch".to_string()),
            |e: &String| !e.contains("dimension"),
            || {
                fallback_ran = true;
                Ok(0)
            },
        );
        assert_eq!(result.unwrap_err(), "dimension mismatch");
        assert!(!fallback_ran);
    }

    #[test]
    fn degradable_error_uses_fallback() {
        let outcome = run_with_fallback_when(
            "embed",
            || Err::<u32, _>("connection refused".to_string()),
            |e: &String| !e.contains("dimension"),
            || Ok(7),
        )
        .unwrap();
        assert!(outcome.used_fallback);
        assert_eq!(outcome.value, 7);
    }
}
