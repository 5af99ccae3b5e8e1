//! Per-round bookkeeping: visited states, generation cost and timing.

use chrono::Utc;
use std::time::Instant;

use super::state::{BuilderState, RoundRecord};
use crate::agents::ConversationStats;
use crate::validation::{Classification, ValidationResult};

struct OpenRound {
    round: u32,
    entry_state: BuilderState,
    states: Vec<BuilderState>,
    cache_hit: bool,
    generation: ConversationStats,
    started_at: chrono::DateTime<Utc>,
    started: Instant,
}

/// How a round ended.
pub struct RoundClose {
    pub classification: Classification,
    pub reason: String,
    pub environment_hash: Option<String>,
    pub eval_script_hash: Option<String>,
    pub validation: Option<ValidationResult>,
}

#[derive(Default)]
pub struct RoundRecorder {
    records: Vec<RoundRecord>,
    current: Option<OpenRound>,
    total: ConversationStats,
}

impl RoundRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    /// Open round `round` unless one is already open.
    pub fn begin(&mut self, round: u32, entry_state: BuilderState, cache_hit: bool) {
        if self.current.is_some() {
            return;
        }
        self.current = Some(OpenRound {
            round,
            entry_state,
            states: vec![entry_state],
            cache_hit,
            generation: ConversationStats::default(),
            started_at: Utc::now(),
            started: Instant::now(),
        });
    }

    pub fn visit(&mut self, state: BuilderState) {
        if let Some(open) = &mut self.current {
            if open.states.last() != Some(&state) {
                open.states.push(state);
            }
        }
    }

    pub fn add_generation(&mut self, stats: &ConversationStats) {
        self.total.add(stats);
        if let Some(open) = &mut self.current {
            open.generation.add(stats);
        }
    }

    /// Close the open round; a no-op when none is open.
    pub fn finish(&mut self, close: RoundClose) -> Option<&RoundRecord> {
        let open = self.current.take()?;
        let record = RoundRecord {
            round: open.round,
            entry_state: open.entry_state,
            states: open.states,
            classification: close.classification,
            reason: close.reason,
            cache_hit: open.cache_hit,
            environment_hash: close.environment_hash,
            eval_script_hash: close.eval_script_hash,
            generation: open.generation,
            started_at: open.started_at,
            finished_at: Utc::now(),
            duration_ms: open.started.elapsed().as_millis() as u64,
            validation: close.validation,
        };
        self.records.push(record);
        self.records.last()
    }

    /// Drop an open round that never reached a classification.
    pub fn abandon(&mut self) {
        self.current = None;
    }

    pub fn records(&self) -> &[RoundRecord] {
        &self.records
    }

    pub fn classification_history(&self) -> Vec<Classification> {
        self.records.iter().map(|r| r.classification).collect()
    }

    /// Generation cost of the whole instance, including abandoned rounds.
    pub fn total_generation(&self) -> ConversationStats {
        self.total
    }

    pub fn into_records(self) -> Vec<RoundRecord> {
        self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Usage;

    fn close(c: Classification) -> RoundClose {
        RoundClose {
            classification: c,
            reason: "r".into(),
            environment_hash: Some("h".into()),
            eval_script_hash: None,
            validation: None,
        }
    }

    #[test]
    fn test_round_lifecycle() {
        let mut rec = RoundRecorder::new();
        rec.begin(1, BuilderState::Explore, false);
        rec.visit(BuilderState::DraftEnv);
        rec.visit(BuilderState::DraftEnv);
        rec.visit(BuilderState::Validate);
        rec.add_generation(&ConversationStats {
            turns: 2,
            usage: Usage {
                prompt_tokens: 5,
                completion_tokens: 5,
                total_tokens: 10,
            },
        });
        let record = rec.finish(close(Classification::BuildFailure)).unwrap();
        assert_eq!(record.round, 1);
        assert_eq!(
            record.states,
            vec![
                BuilderState::Explore,
                BuilderState::DraftEnv,
                BuilderState::Validate
            ]
        );
        assert_eq!(record.generation.turns, 2);
        assert!(!rec.is_open());

        rec.begin(2, BuilderState::DraftEnv, false);
        rec.add_generation(&ConversationStats {
            turns: 1,
            usage: Usage::default(),
        });
        rec.abandon();
        assert!(rec.finish(close(Classification::Success)).is_none());

        assert_eq!(
            rec.classification_history(),
            vec![Classification::BuildFailure]
        );
        assert_eq!(rec.total_generation().turns, 3);
    }

    #[test]
    fn test_begin_is_idempotent_while_open() {
        let mut rec = RoundRecorder::new();
        rec.begin(1, BuilderState::Validate, true);
        rec.begin(2, BuilderState::Explore, false);
        let record = rec.finish(close(Classification::Success)).unwrap();
        assert_eq!(record.round, 1);
        assert!(record.cache_hit);
    }
}
