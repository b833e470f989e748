use crate::core::io::{ArrayIoError, read_toml, write_toml};
use crate::core::metrics::{Metric, MetricType};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const TRACE_FILE: &str = "generation_trace.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedMember {
    /// Worker rank, or member index for populous runs.
    pub member: usize,
    pub value: f64,
}

/// Outcome of ranking one generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub generation: usize,
    pub metric: MetricType,
    pub survivors: Vec<usize>,
    /// Member that became the alpha this generation; absent when the previous alpha was kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alpha_member: Option<usize>,
    pub ranking: Vec<RankedMember>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alpha: Option<Metric>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationTrace {
    #[serde(default)]
    pub generations: Vec<GenerationRecord>,
}

impl GenerationTrace {
    pub fn push(&mut self, record: GenerationRecord) {
        self.generations.push(record);
    }

    pub fn len(&self) -> usize {
        self.generations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generations.is_empty()
    }

    pub fn last(&self) -> Option<&GenerationRecord> {
        self.generations.last()
    }

    pub fn save(&self, dir: &Path) -> Result<(), ArrayIoError> {
        write_toml(&dir.join(TRACE_FILE), self)
    }

    pub fn load(dir: &Path) -> Result<Self, ArrayIoError> {
        read_toml(&dir.join(TRACE_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn trace_survives_a_save_load_cycle() {
        let dir = tempdir().unwrap();
        let mut trace = GenerationTrace::default();
        trace.push(GenerationRecord {
            generation: 0,
            metric: MetricType::Chi,
            survivors: vec![1, 0],
            alpha_member: Some(1),
            ranking: vec![
                RankedMember {
                    member: 1,
                    value: 0.1,
                },
                RankedMember {
                    member: 0,
                    value: 0.3,
                },
            ],
            alpha: Some(Metric {
                chi: 0.1,
                sharpness: 2.0,
                summed_phase: 3.5,
                area: 40.0,
            }),
        });
        trace.push(GenerationRecord {
            generation: 1,
            metric: MetricType::Area,
            survivors: vec![0],
            alpha_member: None,
            ranking: vec![RankedMember {
                member: 0,
                value: 12.0,
            }],
            alpha: None,
        });
        trace.save(dir.path()).unwrap();
        let loaded = GenerationTrace::load(dir.path()).unwrap();
        assert_eq!(loaded, trace);
    }
}
