use std::{str::FromStr, time::Duration};

/// Soft delay before the next page. Platforms rate-limit empirically, so this
/// is tuned per run, never enforced as a hard limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    Fixed(Duration),
    /// Uniformly random in `[min, max]`.
    Between(Duration, Duration),
}

impl Pacing {
    pub fn delay(&self) -> Duration {
        match *self {
            Pacing::Fixed(delay) => delay,
            Pacing::Between(min, max) => {
                let min_ms = min.as_millis() as u64;
                let max_ms = max.as_millis() as u64;
                Duration::from_millis(fastrand::u64(min_ms..=max_ms.max(min_ms)))
            }
        }
    }

    pub async fn wait(&self) {
        let delay = self.delay();
        tracing::debug!(delay = ?delay, "pacing before next page");
        tokio::time::sleep(delay).await;
    }
}

fn seconds(raw: &str) -> Result<Duration, String> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a number of seconds", raw.trim()))?;
    Duration::try_from_secs_f64(value).map_err(|_| format!("'{}' is not a valid delay", raw.trim()))
}

/// `"5"` is a fixed five seconds, `"5-11"` a random delay between five and
/// eleven seconds.
impl FromStr for Pacing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('-') {
            Some((min, max)) => {
                let (min, max) = (seconds(min)?, seconds(max)?);
                if min > max {
                    return Err(format!("empty range '{}'", s));
                }
                Ok(Pacing::Between(min, max))
            }
            None => Ok(Pacing::Fixed(seconds(s)?)),
        }
    }
}
