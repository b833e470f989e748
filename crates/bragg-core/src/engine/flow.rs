//! Compilation of an algorithm sequence and its feature triggers into a flat operation list.
//!
//! The algorithm grammar is
//!
//! ```text
//! sequence  := term ('+' term)*
//! term      := COUNT '*' operand | operand
//! operand   := PRIMITIVE | '(' sequence ')'
//! PRIMITIVE := ('ER' | 'HIO') ['.pc']
//! ```
//!
//! so `3*(20*ER+180*HIO)+20*ER` expands to 620 primitive steps. Each step becomes one
//! iteration of the compiled [`Flow`], bracketed by the optional feature operations whose
//! triggers fire at that iteration.

use super::config::{ConfigError, ReconstructionConfig, Trigger};

const MAX_STEPS: usize = 10_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// Error reduction.
    Er,
    /// Hybrid input-output.
    Hio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepDescriptor {
    pub algorithm: Algorithm,
    /// Runs the coherence-convolved modulus projection when partial coherence is active.
    pub coherent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowOp {
    Next,
    LowPassFilter,
    ResetResolution,
    ShrinkWrap,
    PhaseConstraint,
    ToReciprocal,
    CoherenceUpdate,
    CoherentModulus,
    Modulus,
    StorePreviousAmplitudes,
    ToDirect,
    Er,
    Hio,
    TwinRemoval,
    Average,
    Progress,
}

struct Parser {
    chars: Vec<(usize, char)>,
    pos: usize,
}

impl Parser {
    fn new(source: &str) -> Self {
        Self {
            chars: source
                .char_indices()
                .filter(|(_, c)| !c.is_whitespace())
                .collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).map(|(_, c)| *c)
    }

    fn position(&self) -> usize {
        self.chars
            .get(self.pos)
            .map(|(i, _)| *i)
            .unwrap_or_else(|| self.chars.last().map_or(0, |(i, c)| i + c.len_utf8()))
    }

    fn error(&self, reason: impl Into<String>) -> ConfigError {
        ConfigError::AlgorithmSyntax {
            position: self.position(),
            reason: reason.into(),
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), ConfigError> {
        match self.peek() {
            Some(c) if c == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(c) => Err(self.error(format!("expected '{expected}', found '{c}'"))),
            None => Err(self.error(format!("expected '{expected}', found end of input"))),
        }
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek().filter(|c| pred(*c)) {
            out.push(c);
            self.pos += 1;
        }
        out
    }

    fn parse(mut self) -> Result<Vec<StepDescriptor>, ConfigError> {
        if self.chars.is_empty() {
            return Err(self.error("empty algorithm sequence"));
        }
        let steps = self.sequence()?;
        if let Some(c) = self.peek() {
            return Err(self.error(format!("unexpected '{c}'")));
        }
        Ok(steps)
    }

    fn sequence(&mut self) -> Result<Vec<StepDescriptor>, ConfigError> {
        let mut steps = self.term()?;
        while self.peek() == Some('+') {
            self.pos += 1;
            steps.extend(self.term()?);
            check_size(steps.len(), self)?;
        }
        Ok(steps)
    }

    fn term(&mut self) -> Result<Vec<StepDescriptor>, ConfigError> {
        if !self.peek().is_some_and(|c| c.is_ascii_digit()) {
            return self.operand();
        }
        let digits = self.take_while(|c| c.is_ascii_digit());
        let count: usize = digits
            .parse()
            .map_err(|_| self.error(format!("count '{digits}' is too large")))?;
        if count == 0 {
            return Err(self.error("repeat counts must be positive"));
        }
        self.expect('*')?;
        let body = self.operand()?;
        check_size(body.len().saturating_mul(count), self)?;
        Ok(body.repeat(count))
    }

    fn operand(&mut self) -> Result<Vec<StepDescriptor>, ConfigError> {
        match self.peek() {
            Some('(') => {
                self.pos += 1;
                let inner = self.sequence()?;
                self.expect(')')?;
                Ok(inner)
            }
            Some(c) if c.is_ascii_alphabetic() => Ok(vec![self.primitive()?]),
            Some(c) => Err(self.error(format!("unexpected '{c}'"))),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn primitive(&mut self) -> Result<StepDescriptor, ConfigError> {
        let start = self.pos;
        let name = self.take_while(|c| c.is_ascii_alphanumeric() || c == '_');
        let algorithm = match name.as_str() {
            "ER" => Algorithm::Er,
            "HIO" => Algorithm::Hio,
            _ => {
                self.pos = start;
                return Err(self.error(format!("unknown primitive '{name}'")));
            }
        };
        let mut coherent = false;
        if self.peek() == Some('.') {
            self.pos += 1;
            let modifier = self.take_while(|c| c.is_ascii_alphanumeric());
            if modifier != "pc" {
                return Err(self.error(format!("unknown step modifier '.{modifier}'")));
            }
            coherent = true;
        }
        Ok(StepDescriptor {
            algorithm,
            coherent,
        })
    }
}

fn check_size(len: usize, parser: &Parser) -> Result<(), ConfigError> {
    if len > MAX_STEPS {
        return Err(parser.error(format!("sequence expands beyond {MAX_STEPS} steps")));
    }
    Ok(())
}

/// Parses and expands an algorithm sequence into one descriptor per iteration.
pub fn parse_sequence(source: &str) -> Result<Vec<StepDescriptor>, ConfigError> {
    Parser::new(source).parse()
}

/// Marks the iterations in `[0, total)` at which any of `triggers` fires.
pub fn schedule(
    feature: &'static str,
    triggers: &[Trigger],
    total: usize,
) -> Result<Vec<bool>, ConfigError> {
    let resolve = |value: i64| -> Result<usize, ConfigError> {
        let resolved = if value < 0 { total as i64 + value } else { value };
        if resolved < 0 || resolved >= total as i64 {
            return Err(ConfigError::TriggerOutOfRange {
                feature,
                iteration: value,
                total,
            });
        }
        Ok(resolved as usize)
    };

    let mut fired = vec![false; total];
    for trigger in triggers {
        let (start, step, stop) = match *trigger {
            Trigger::Once { at } => {
                let at = resolve(at)?;
                (at, 1, at)
            }
            Trigger::Periodic { start, step } => (resolve(start)?, step, total - 1),
            Trigger::Bounded { start, step, stop } => (resolve(start)?, step, resolve(stop)?),
        };
        if step <= 0 {
            return Err(ConfigError::InvalidTrigger {
                feature,
                reason: format!("step must be positive, found {step}"),
            });
        }
        if stop < start {
            return Err(ConfigError::InvalidTrigger {
                feature,
                reason: format!("stop {stop} precedes start {start}"),
            });
        }
        for i in (start..=stop).step_by(step as usize) {
            fired[i] = true;
        }
    }
    Ok(fired)
}

/// Caller-side adjustments applied before compiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowOptions {
    /// Drops the low-pass filter, phase constraint and twin removal triggers.
    pub suppress_one_shot: bool,
    /// Lets `.pc` steps run the coherent modulus when partial coherence is configured.
    pub coherence_enabled: bool,
}

impl Default for FlowOptions {
    fn default() -> Self {
        Self {
            suppress_one_shot: false,
            coherence_enabled: true,
        }
    }
}

/// The compiled operation schedule of one reconstruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Flow {
    ops: Vec<FlowOp>,
    iterations: usize,
    coherent: bool,
}

impl Flow {
    pub fn compile(
        config: &ReconstructionConfig,
        options: &FlowOptions,
    ) -> Result<Self, ConfigError> {
        let steps = parse_sequence(&config.algorithm_sequence)?;
        let total = steps.len();
        let never = vec![false; total];

        let shrink_wrap = match &config.shrink_wrap {
            Some(sw) => schedule("shrink_wrap", &sw.triggers, total)?,
            None => never.clone(),
        };
        let average = schedule("average", &config.average_triggers, total)?;
        let progress = schedule("progress", &config.progress_triggers, total)?;

        let (phase, twin, lowpass, reset_at) = if options.suppress_one_shot {
            (never.clone(), never.clone(), never.clone(), None)
        } else {
            let phase = match &config.phase_constraint {
                Some(phc) => schedule("phc", &phc.triggers, total)?,
                None => never.clone(),
            };
            let twin = match &config.twin {
                Some(twin) => schedule("twin", &twin.triggers, total)?,
                None => never.clone(),
            };
            let lowpass = match &config.lowpass {
                Some(lpf) => schedule("lowpass_filter", &[lpf.trigger], total)?,
                None => never.clone(),
            };
            let reset_at = lowpass
                .iter()
                .rposition(|&f| f)
                .map(|last| last + 1)
                .filter(|&i| i < total);
            (phase, twin, lowpass, reset_at)
        };

        let coherent: Vec<bool> = steps
            .iter()
            .map(|s| s.coherent && options.coherence_enabled && config.coherence.is_some())
            .collect();
        let mut update = never;
        if let (Some(first), Some(pc)) = (coherent.iter().position(|&c| c), &config.coherence) {
            for i in (first + 1)..total {
                update[i] = coherent[i] && (i - first) % pc.interval == 0;
            }
        }

        let mut ops = Vec::with_capacity(total * 6);
        for (i, step) in steps.iter().enumerate() {
            ops.push(FlowOp::Next);
            if lowpass[i] {
                ops.push(FlowOp::LowPassFilter);
            }
            if reset_at == Some(i) {
                ops.push(FlowOp::ResetResolution);
            }
            if shrink_wrap[i] && !lowpass[i] {
                ops.push(FlowOp::ShrinkWrap);
            }
            if phase[i] {
                ops.push(FlowOp::PhaseConstraint);
            }
            ops.push(FlowOp::ToReciprocal);
            if update[i] {
                ops.push(FlowOp::CoherenceUpdate);
            }
            ops.push(if coherent[i] {
                FlowOp::CoherentModulus
            } else {
                FlowOp::Modulus
            });
            if update.get(i + 1).copied().unwrap_or(false) {
                ops.push(FlowOp::StorePreviousAmplitudes);
            }
            ops.push(FlowOp::ToDirect);
            ops.push(match step.algorithm {
                Algorithm::Er => FlowOp::Er,
                Algorithm::Hio => FlowOp::Hio,
            });
            if twin[i] {
                ops.push(FlowOp::TwinRemoval);
            }
            if average[i] {
                ops.push(FlowOp::Average);
            }
            if progress[i] {
                ops.push(FlowOp::Progress);
            }
        }

        Ok(Self {
            ops,
            iterations: total,
            coherent: coherent.iter().any(|&c| c),
        })
    }

    pub fn ops(&self) -> &[FlowOp] {
        &self.ops
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Whether any iteration runs the coherent modulus.
    pub fn is_coherent(&self) -> bool {
        self.coherent
    }

    pub fn modulus_steps(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, FlowOp::Modulus | FlowOp::CoherentModulus))
            .count()
    }

    /// Iterations (zero-based) whose slice contains `op`.
    pub fn firing_iterations(&self, op: FlowOp) -> Vec<usize> {
        let mut iteration = 0usize;
        let mut fired = Vec::new();
        for (index, current) in self.ops.iter().enumerate() {
            if *current == FlowOp::Next && index > 0 {
                iteration += 1;
            }
            if *current == op && fired.last() != Some(&iteration) {
                fired.push(iteration);
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::{
        CoherenceConfig, LowPassConfig, PhaseConstraintConfig, ReconstructionConfigBuilder,
        ShrinkWrapConfig, TwinConfig,
    };

    fn config(sequence: &str) -> ReconstructionConfigBuilder {
        ReconstructionConfigBuilder::new().algorithm_sequence(sequence)
    }

    fn compile(builder: ReconstructionConfigBuilder) -> Result<Flow, ConfigError> {
        Flow::compile(&builder.build().unwrap(), &FlowOptions::default())
    }

    #[test]
    fn nested_sequence_expands_to_sum_of_products() {
        let steps = parse_sequence("3*(20*ER+180*HIO)+20*ER").unwrap();
        assert_eq!(steps.len(), 620);
        assert_eq!(steps[0].algorithm, Algorithm::Er);
        assert_eq!(steps[20].algorithm, Algorithm::Hio);
        assert_eq!(steps[619].algorithm, Algorithm::Er);
    }

    #[test]
    fn whitespace_is_ignored_and_parentheses_nest() {
        let steps = parse_sequence(" 2 * ( 2*( ER + HIO ) + ER ) ").unwrap();
        assert_eq!(steps.len(), 10);
    }

    #[test]
    fn pc_suffix_tags_steps_as_coherent() {
        let steps = parse_sequence("2*ER+3*HIO.pc").unwrap();
        assert_eq!(steps.iter().filter(|s| s.coherent).count(), 3);
        assert!(!steps[0].coherent);
    }

    #[test]
    fn malformed_sequences_are_rejected() {
        for bad in [
            "", "3*(ER", "ER)", "x*ER", "0*ER", "FOO", "ER.xx", "3*", "ER+", "3ER", "(3*ER",
            "2**ER",
        ] {
            assert!(
                matches!(
                    parse_sequence(bad),
                    Err(ConfigError::AlgorithmSyntax { .. })
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn compiled_flow_has_one_modulus_per_step() {
        let flow = compile(config("3*(20*ER+180*HIO)+20*ER")).unwrap();
        assert_eq!(flow.iterations(), 620);
        assert_eq!(flow.modulus_steps(), 620);
        assert_eq!(flow.firing_iterations(FlowOp::Next).len(), 620);
    }

    #[test]
    fn periodic_shrink_wrap_fires_exactly_on_schedule() {
        let flow = compile(config("50*ER").shrink_wrap(ShrinkWrapConfig {
            triggers: vec![Trigger::Periodic { start: 3, step: 7 }],
            ..ShrinkWrapConfig::default()
        }))
        .unwrap();
        let expected: Vec<usize> = (0..50).filter(|i| *i >= 3 && (i - 3) % 7 == 0).collect();
        assert_eq!(flow.firing_iterations(FlowOp::ShrinkWrap), expected);
    }

    #[test]
    fn bounded_trigger_includes_stop() {
        let fired = schedule(
            "x",
            &[Trigger::Bounded {
                start: 2,
                step: 2,
                stop: 6,
            }],
            10,
        )
        .unwrap();
        let on: Vec<usize> = (0..10).filter(|&i| fired[i]).collect();
        assert_eq!(on, vec![2, 4, 6]);
    }

    #[test]
    fn negative_start_counts_from_the_end() {
        let fired = schedule("average", &[Trigger::Periodic { start: -3, step: 1 }], 10).unwrap();
        let on: Vec<usize> = (0..10).filter(|&i| fired[i]).collect();
        assert_eq!(on, vec![7, 8, 9]);
    }

    #[test]
    fn out_of_range_trigger_is_a_configuration_error() {
        let result = compile(config("10*ER").shrink_wrap(ShrinkWrapConfig {
            triggers: vec![Trigger::Periodic { start: 10, step: 1 }],
            ..ShrinkWrapConfig::default()
        }));
        assert!(matches!(
            result,
            Err(ConfigError::TriggerOutOfRange { iteration: 10, .. })
        ));
    }

    #[test]
    fn zero_step_is_rejected() {
        let result = schedule("x", &[Trigger::Periodic { start: 0, step: 0 }], 5);
        assert!(matches!(result, Err(ConfigError::InvalidTrigger { .. })));
    }

    #[test]
    fn operations_within_an_iteration_follow_the_fixed_order() {
        let flow = compile(
            config("2*HIO")
                .shrink_wrap(ShrinkWrapConfig {
                    triggers: vec![Trigger::Once { at: 0 }],
                    ..ShrinkWrapConfig::default()
                })
                .phase_constraint(PhaseConstraintConfig {
                    triggers: vec![Trigger::Once { at: 0 }],
                    ..PhaseConstraintConfig::default()
                })
                .twin(TwinConfig {
                    triggers: vec![Trigger::Once { at: 0 }],
                    halves: [0, 0],
                })
                .average_triggers(vec![Trigger::Once { at: 0 }])
                .progress_triggers(vec![Trigger::Once { at: 0 }]),
        )
        .unwrap();
        assert_eq!(
            &flow.ops()[..11],
            &[
                FlowOp::Next,
                FlowOp::ShrinkWrap,
                FlowOp::PhaseConstraint,
                FlowOp::ToReciprocal,
                FlowOp::Modulus,
                FlowOp::ToDirect,
                FlowOp::Hio,
                FlowOp::TwinRemoval,
                FlowOp::Average,
                FlowOp::Progress,
                FlowOp::Next,
            ]
        );
        assert_eq!(
            &flow.ops()[11..],
            &[FlowOp::ToReciprocal, FlowOp::Modulus, FlowOp::ToDirect, FlowOp::Hio]
        );
    }

    #[test]
    fn suppression_removes_one_shot_operations_only() {
        let built = config("10*ER")
            .shrink_wrap(ShrinkWrapConfig::default())
            .phase_constraint(PhaseConstraintConfig {
                triggers: vec![Trigger::Periodic { start: 0, step: 1 }],
                ..PhaseConstraintConfig::default()
            })
            .twin(TwinConfig {
                triggers: vec![Trigger::Once { at: 2 }],
                halves: [0, 1],
            })
            .build()
            .unwrap();
        let options = FlowOptions {
            suppress_one_shot: true,
            ..FlowOptions::default()
        };
        let flow = Flow::compile(&built, &options).unwrap();
        assert!(flow.firing_iterations(FlowOp::PhaseConstraint).is_empty());
        assert!(flow.firing_iterations(FlowOp::TwinRemoval).is_empty());
        assert_eq!(flow.firing_iterations(FlowOp::ShrinkWrap).len(), 9);
    }

    #[test]
    fn coherence_updates_follow_interval_and_store_previous_amplitudes() {
        let flow = compile(config("4*ER+8*HIO.pc").coherence(CoherenceConfig {
            interval: 3,
            ..CoherenceConfig::default()
        }))
        .unwrap();
        assert!(flow.is_coherent());
        assert_eq!(flow.firing_iterations(FlowOp::CoherentModulus).len(), 8);
        assert_eq!(flow.firing_iterations(FlowOp::CoherenceUpdate), vec![7, 10]);
        assert_eq!(
            flow.firing_iterations(FlowOp::StorePreviousAmplitudes),
            vec![6, 9]
        );
    }

    #[test]
    fn pc_steps_without_coherence_config_run_plain_modulus() {
        let flow = compile(config("4*ER.pc")).unwrap();
        assert!(!flow.is_coherent());
        assert_eq!(flow.firing_iterations(FlowOp::Modulus).len(), 4);
    }

    #[test]
    fn lowpass_range_is_followed_by_a_resolution_reset() {
        let flow = compile(
            config("10*ER")
                .lowpass(LowPassConfig {
                    trigger: Trigger::Bounded {
                        start: 0,
                        step: 1,
                        stop: 4,
                    },
                    range: [0.4, 1.0],
                    sw_threshold: 0.1,
                })
                .shrink_wrap(ShrinkWrapConfig::default()),
        )
        .unwrap();
        assert_eq!(
            flow.firing_iterations(FlowOp::LowPassFilter),
            vec![0, 1, 2, 3, 4]
        );
        assert_eq!(flow.firing_iterations(FlowOp::ResetResolution), vec![5]);
        assert_eq!(
            flow.firing_iterations(FlowOp::ShrinkWrap),
            vec![5, 6, 7, 8, 9]
        );
    }
}
