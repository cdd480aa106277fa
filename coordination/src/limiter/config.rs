use super::*;

/// Admission limits. Each present key instantiates one internal strategy;
/// a reservation must fit every strategy at once (AND semantics).
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    pub per_second: Option<NonZeroUsize>,
    pub per_minute: Option<NonZeroUsize>,
    pub per_hour: Option<NonZeroUsize>,
    pub per_timespan: Option<TimespanConfig>,
    pub parallel: Option<NonZeroUsize>,
}

/// A custom time-window limit: at most `count` weight per `delay`.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimespanConfig {
    pub delay: Duration,
    pub count: NonZeroUsize,
}

impl Config {
    pub(crate) fn build(&self) -> Result<Vec<Strategy>> {
        let mut strategies = Vec::new();
        if let Some(count) = self.per_second {
            strategies.push(Strategy::time_window(Duration::from_secs(1), count));
        }
        if let Some(count) = self.per_minute {
            strategies.push(Strategy::time_window(Duration::from_secs(60), count));
        }
        if let Some(count) = self.per_hour {
            strategies.push(Strategy::time_window(Duration::from_secs(3600), count));
        }
        if let Some(timespan) = &self.per_timespan {
            strategies.push(Strategy::time_window(timespan.delay, timespan.count));
        }
        if let Some(count) = self.parallel {
            strategies.push(Strategy::parallel(count));
        }
        if strategies.is_empty() {
            return Err(Error::InvalidOperation(
                "admission controller requires at least one configured limit",
            ));
        }
        Ok(strategies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_rejected() {
        assert!(matches!(
            Config::default().build(),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_each_present_key_adds_one_strategy() {
        let config = Config {
            per_second: NonZeroUsize::new(10),
            per_timespan: Some(TimespanConfig {
                delay: Duration::from_millis(500),
                count: NonZeroUsize::new(3).unwrap(),
            }),
            parallel: NonZeroUsize::new(2),
            ..Default::default()
        };
        let strategies = config.build().unwrap();
        assert_eq!(strategies.len(), 3);
        assert_eq!(
            strategies.iter().map(|s| s.max_weight).min().unwrap(),
            2
        );
    }
}
