use std::time::Duration;

/// An iterator of delays between attempts at an operation, which grow by a
/// constant factor up to a maximum delay. Upon reaching the maximum, that
/// value is returned from then on, until the number of attempts runs out.
///
pub struct ExponentialBackoff {
    curr: Duration,
    max: Duration,
    factor: u32,
    attempts: Option<usize>,
}

impl ExponentialBackoff {
    pub fn new(start: Duration, max: Duration, factor: u32, attempts: Option<usize>) -> Self {
        Self {
            curr: start,
            max,
            factor,
            attempts,
        }
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.attempts {
            Some(0) => return None,
            Some(n) => *n -= 1,
            None => (),
        }
        let delay = self.curr;
        self.curr = (self.curr * self.factor).min(self.max);
        Some(delay)
    }
}

/// Execute `f` until it returns `Ok`, sleeping for the next delay of the
/// backoff after each failure. The `on_err` closure sees each error and the
/// delay which follows it (for logging). If the backoff runs out, the last
/// error is returned; `None` means `f` was never attempted.
///
pub fn retry<F, S, T, E>(backoff: ExponentialBackoff, mut f: F, on_err: S) -> Option<Result<T, E>>
where
    F: FnMut() -> Result<T, E>,
    S: Fn(&E, Duration),
{
    let mut last_err = None;
    let mut delays = backoff.peekable();

    while let Some(delay) = delays.next() {
        match f() {
            Ok(v) => return Some(Ok(v)),
            Err(e) => {
                if delays.peek().is_some() {
                    on_err(&e, delay);
                    std::thread::sleep(delay);
                }
                last_err = Some(Err(e));
            }
        }
    }
    last_err
}




// ============================================================================
#[cfg(test)]
mod test {

    use std::cell::Cell;
    use std::time::Duration;

    use super::{retry, ExponentialBackoff};

    #[test]
    fn delays_grow_to_the_maximum() {
        let ms = Duration::from_millis;
        let delays: Vec<_> = ExponentialBackoff::new(ms(1), ms(5), 2, Some(5)).collect();
        assert_eq!(delays, vec![ms(1), ms(2), ms(4), ms(5), ms(5)]);
    }

    #[test]
    fn retry_stops_at_the_first_success() {
        let calls = Cell::new(0);
        let backoff = ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(1), 2, Some(10));
        let result = retry(
            backoff,
            || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 { Err("no") } else { Ok(calls.get()) }
            },
            |_, _| (),
        );
        assert_eq!(result, Some(Ok(3)));
    }

    #[test]
    fn retry_returns_the_last_error() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(1), 2, Some(2));
        let result: Option<Result<(), _>> = retry(backoff, || Err("no"), |_, _| ());
        assert_eq!(result, Some(Err("no")));
    }
}
