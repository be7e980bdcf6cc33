// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Trigger specifications and their runtime state
//!
//! A trigger decides when a dataset flushes a buffered table downstream.
//! Each buffered table gets its own trigger instance built from the node's
//! [`TriggerSpec`].

use crate::exec::table::{GroupKey, DEFAULT_STOP_COL_LABEL};
use crate::exec::time::Time;
use serde::{Deserialize, Serialize};

/// Policy controlling when buffered table data is flushed downstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerSpec {
    /// Fire once the watermark passes the table's `_stop` plus the lateness
    AfterWatermark {
        #[serde(default)]
        allowed_lateness: i64,
    },
    /// Re-arm the inner trigger every time it fires
    Repeated { trigger: Box<TriggerSpec> },
    /// Fire once `duration` nanoseconds of processing time have elapsed
    AfterProcessingTime { duration: i64 },
    /// Fire once at least `count` rows are buffered
    AfterAtLeastCount { count: usize },
    /// Fire when `main` fires, finish for good when `finally` fires
    OrFinally {
        main: Box<TriggerSpec>,
        finally: Box<TriggerSpec>,
    },
    /// Fire as soon as any rows are buffered
    Narrow,
}

impl Default for TriggerSpec {
    fn default() -> Self {
        TriggerSpec::AfterWatermark {
            allowed_lateness: 0,
        }
    }
}

/// What a trigger gets to see about one buffered table
#[derive(Debug, Clone)]
pub struct TriggerContext<'a> {
    pub key: &'a GroupKey,
    pub count: usize,
    pub watermark: Time,
    pub current_processing_time: Time,
}

/// Runtime state of a trigger for one table
#[derive(Debug, Clone)]
pub struct Trigger {
    state: TriggerState,
}

#[derive(Debug, Clone)]
enum TriggerState {
    AfterWatermark {
        allowed_lateness: i64,
        finished: bool,
    },
    Repeated {
        spec: TriggerSpec,
        current: Box<Trigger>,
    },
    AfterProcessingTime {
        duration: i64,
        start: Option<Time>,
        finished: bool,
    },
    AfterAtLeastCount {
        count: usize,
        finished: bool,
    },
    OrFinally {
        main: Box<Trigger>,
        finally: Box<Trigger>,
        finished: bool,
    },
    Narrow,
}

impl Trigger {
    pub fn new(spec: &TriggerSpec) -> Self {
        let state = match spec {
            TriggerSpec::AfterWatermark { allowed_lateness } => TriggerState::AfterWatermark {
                allowed_lateness: *allowed_lateness,
                finished: false,
            },
            TriggerSpec::Repeated { trigger } => TriggerState::Repeated {
                spec: (**trigger).clone(),
                current: Box::new(Trigger::new(trigger)),
            },
            TriggerSpec::AfterProcessingTime { duration } => TriggerState::AfterProcessingTime {
                duration: *duration,
                start: None,
                finished: false,
            },
            TriggerSpec::AfterAtLeastCount { count } => TriggerState::AfterAtLeastCount {
                count: *count,
                finished: false,
            },
            TriggerSpec::OrFinally { main, finally } => TriggerState::OrFinally {
                main: Box::new(Trigger::new(main)),
                finally: Box::new(Trigger::new(finally)),
                finished: false,
            },
            TriggerSpec::Narrow => TriggerState::Narrow,
        };
        Self { state }
    }

    /// Evaluate the trigger. Returns true if the table should be flushed now.
    pub fn triggered(&mut self, c: &TriggerContext<'_>) -> bool {
        match &mut self.state {
            TriggerState::AfterWatermark {
                allowed_lateness,
                finished,
            } => match c.key.value_time(DEFAULT_STOP_COL_LABEL) {
                Some(stop) if c.watermark >= stop.saturating_add(*allowed_lateness) => {
                    *finished = true;
                    true
                }
                _ => false,
            },
            TriggerState::Repeated { spec, current } => {
                let fired = current.triggered(c);
                if fired {
                    **current = Trigger::new(spec);
                }
                fired
            }
            TriggerState::AfterProcessingTime {
                duration,
                start,
                finished,
            } => {
                let start = *start.get_or_insert(c.current_processing_time);
                if c.current_processing_time >= start.saturating_add(*duration) {
                    *finished = true;
                    true
                } else {
                    false
                }
            }
            TriggerState::AfterAtLeastCount { count, finished } => {
                if c.count >= *count {
                    *finished = true;
                    true
                } else {
                    false
                }
            }
            TriggerState::OrFinally {
                main,
                finally,
                finished,
            } => {
                if finally.triggered(c) {
                    *finished = true;
                    true
                } else {
                    main.triggered(c)
                }
            }
            TriggerState::Narrow => c.count > 0,
        }
    }

    /// A finished trigger never fires again; its table can be expired.
    pub fn finished(&self) -> bool {
        match &self.state {
            TriggerState::AfterWatermark { finished, .. }
            | TriggerState::AfterProcessingTime { finished, .. }
            | TriggerState::AfterAtLeastCount { finished, .. }
            | TriggerState::OrFinally { finished, .. } => *finished,
            TriggerState::Repeated { .. } | TriggerState::Narrow => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::table::group_key_of;
    use crate::exec::value::Value;

    fn ctx(key: &GroupKey, count: usize, watermark: i64, pt: i64) -> TriggerContext<'_> {
        TriggerContext {
            key,
            count,
            watermark: Time(watermark),
            current_processing_time: Time(pt),
        }
    }

    #[test]
    fn test_after_watermark_uses_stop_column() {
        let key = group_key_of(&[("_stop", Value::Time(Time(100)))]).unwrap();
        let mut t = Trigger::new(&TriggerSpec::AfterWatermark {
            allowed_lateness: 10,
        });
        assert!(!t.triggered(&ctx(&key, 5, 100, 0)));
        assert!(t.triggered(&ctx(&key, 5, 110, 0)));
        assert!(t.finished());
    }

    #[test]
    fn test_after_watermark_without_stop_never_fires() {
        let key = GroupKey::empty();
        let mut t = Trigger::new(&TriggerSpec::default());
        assert!(!t.triggered(&ctx(&key, 5, i64::MAX, 0)));
    }

    #[test]
    fn test_repeated_rearms() {
        let key = GroupKey::empty();
        let mut t = Trigger::new(&TriggerSpec::Repeated {
            trigger: Box::new(TriggerSpec::AfterAtLeastCount { count: 2 }),
        });
        assert!(!t.triggered(&ctx(&key, 1, 0, 0)));
        assert!(t.triggered(&ctx(&key, 2, 0, 0)));
        assert!(!t.finished());
        assert!(t.triggered(&ctx(&key, 3, 0, 0)));
    }

    #[test]
    fn test_after_processing_time() {
        let key = GroupKey::empty();
        let mut t = Trigger::new(&TriggerSpec::AfterProcessingTime { duration: 50 });
        assert!(!t.triggered(&ctx(&key, 1, 0, 100)));
        assert!(!t.triggered(&ctx(&key, 1, 0, 149)));
        assert!(t.triggered(&ctx(&key, 1, 0, 150)));
    }

    #[test]
    fn test_or_finally() {
        let key = group_key_of(&[("_stop", Value::Time(Time(10)))]).unwrap();
        let mut t = Trigger::new(&TriggerSpec::OrFinally {
            main: Box::new(TriggerSpec::Narrow),
            finally: Box::new(TriggerSpec::default()),
        });
        assert!(t.triggered(&ctx(&key, 1, 0, 0)));
        assert!(!t.finished());
        assert!(t.triggered(&ctx(&key, 0, 10, 0)));
        assert!(t.finished());
    }

    #[test]
    fn test_spec_json() {
        let spec: TriggerSpec =
            serde_json::from_str(r#"{"kind":"after_at_least_count","count":3}"#).unwrap();
        assert_eq!(spec, TriggerSpec::AfterAtLeastCount { count: 3 });
        let spec: TriggerSpec = serde_json::from_str(r#"{"kind":"after_watermark"}"#).unwrap();
        assert_eq!(spec, TriggerSpec::default());
    }
}
