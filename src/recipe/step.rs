//! Recipe step mini-language and ramp expansion.
//!
//! Each table entry is a semicolon-separated record:
//!
//! ```text
//! duration ; value ; mode [ ; extra ... ]
//! ```
//!
//! with `mode ∈ {s, r}`. A ramp (`r`) carries a required sub-step duration
//! and, for direction-aware devices, an optional `CW`/`CCW` token; a step
//! (`s`) may carry the direction token directly. Unknown mode tokens are a
//! hard recipe-read error, not something to guess around.

use crate::recipe::RecipeError;
use serde::{Deserialize, Serialize};

/// Rotation sense for direction-aware devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Cw,
    Ccw,
}

impl Direction {
    fn parse(token: &str, line: usize) -> Result<Self, RecipeError> {
        match token {
            "CW" => Ok(Direction::Cw),
            "CCW" => Ok(Direction::Ccw),
            other => Err(RecipeError::Malformed {
                line,
                reason: format!("unknown direction token '{other}'"),
            }),
        }
    }

    /// Sign of the angular displacement this sense produces.
    pub fn sign(self) -> f64 {
        match self {
            Direction::Cw => 1.0,
            Direction::Ccw => -1.0,
        }
    }
}

/// Step flavor: hold a value, or ramp linearly towards it.
#[derive(Debug, Clone, PartialEq)]
pub enum StepMode {
    Step,
    Ramp { substep_secs: f64 },
}

/// One parsed table entry.
#[derive(Debug, Clone, PartialEq)]
pub struct RecipeStep {
    pub duration_secs: f64,
    pub target: f64,
    pub mode: StepMode,
    pub direction: Option<Direction>,
}

impl RecipeStep {
    /// Parse one `duration ; value ; mode [ ; extra ]` entry. `line` is the
    /// 1-based table line for error reporting.
    pub fn parse_line(entry: &str, line: usize) -> Result<Self, RecipeError> {
        let fields: Vec<&str> = entry.split(';').map(str::trim).collect();
        if fields.len() < 3 {
            return Err(RecipeError::Malformed {
                line,
                reason: format!("expected 'duration ; value ; mode', got '{entry}'"),
            });
        }

        let duration_secs: f64 = fields[0].parse().map_err(|_| RecipeError::Malformed {
            line,
            reason: format!("duration '{}' is not numeric", fields[0]),
        })?;
        if !duration_secs.is_finite() || duration_secs < 0.0 {
            return Err(RecipeError::Malformed {
                line,
                reason: format!("duration {duration_secs} must be >= 0"),
            });
        }

        let target: f64 = fields[1].parse().map_err(|_| RecipeError::Malformed {
            line,
            reason: format!("value '{}' is not numeric", fields[1]),
        })?;
        if !target.is_finite() {
            return Err(RecipeError::Malformed {
                line,
                reason: "value must be finite".into(),
            });
        }

        match fields[2] {
            "s" => {
                let direction = match fields.get(3) {
                    Some(token) if !token.is_empty() => Some(Direction::parse(token, line)?),
                    _ => None,
                };
                Ok(Self {
                    duration_secs,
                    target,
                    mode: StepMode::Step,
                    direction,
                })
            }
            "r" => {
                let substep_field = fields.get(3).filter(|f| !f.is_empty()).ok_or_else(|| {
                    RecipeError::Malformed {
                        line,
                        reason: "ramp entry is missing its sub-step duration".into(),
                    }
                })?;
                let substep_secs: f64 =
                    substep_field.parse().map_err(|_| RecipeError::Malformed {
                        line,
                        reason: format!("sub-step duration '{substep_field}' is not numeric"),
                    })?;
                if !substep_secs.is_finite() || substep_secs <= 0.0 {
                    return Err(RecipeError::Malformed {
                        line,
                        reason: format!("sub-step duration {substep_secs} must be > 0"),
                    });
                }
                let direction = match fields.get(4) {
                    Some(token) if !token.is_empty() => Some(Direction::parse(token, line)?),
                    _ => None,
                };
                Ok(Self {
                    duration_secs,
                    target,
                    mode: StepMode::Ramp { substep_secs },
                    direction,
                })
            }
            other => Err(RecipeError::UnknownMode {
                line,
                mode: other.to_string(),
            }),
        }
    }
}

/// Parse a whole step table. Blank lines and `#` comments are skipped; line
/// numbers in errors refer to the original table.
pub fn parse_table(lines: &[String]) -> Result<Vec<RecipeStep>, RecipeError> {
    let mut steps = Vec::new();
    for (i, raw) in lines.iter().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        steps.push(RecipeStep::parse_line(line, i + 1)?);
    }
    Ok(steps)
}

/// One expanded (value, duration) pair the run engine walks.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedStep {
    pub value: f64,
    pub duration_secs: f64,
    pub direction: Option<Direction>,
    /// 1-based index of the table entry this pair came from
    pub source_step: usize,
}

/// Expand a step table into its (value, duration) sequence.
///
/// A `Step` contributes one pair. A `Ramp` contributes
/// `floor(duration / substep)` pairs advancing linearly from the previous
/// expanded value, with the final pair pinned exactly to the target so
/// floating-point drift can never miss the nominal value; every sub-step,
/// the last included, runs for the configured sub-step duration.
///
/// When the very first entry is a ramp its implicit starting point is the
/// device's current measured value, passed as `start_value`; `None` rejects
/// the expansion.
pub fn expand(
    steps: &[RecipeStep],
    start_value: Option<f64>,
) -> Result<Vec<ExpandedStep>, RecipeError> {
    let mut expanded = Vec::new();
    let mut previous = start_value;

    for (i, step) in steps.iter().enumerate() {
        let source_step = i + 1;
        match &step.mode {
            StepMode::Step => {
                expanded.push(ExpandedStep {
                    value: step.target,
                    duration_secs: step.duration_secs,
                    direction: step.direction,
                    source_step,
                });
            }
            StepMode::Ramp { substep_secs } => {
                let from = previous.ok_or(RecipeError::NoMeasurement)?;
                let count = (step.duration_secs / substep_secs).floor() as usize;
                if count == 0 {
                    return Err(RecipeError::InvalidRamp {
                        step: source_step,
                        reason: format!(
                            "sub-step of {substep_secs}s does not fit into {}s",
                            step.duration_secs
                        ),
                    });
                }
                let increment = (step.target - from) / count as f64;
                for k in 1..count {
                    expanded.push(ExpandedStep {
                        value: from + increment * k as f64,
                        duration_secs: *substep_secs,
                        direction: step.direction,
                        source_step,
                    });
                }
                // Final sub-step pinned exactly to the target.
                expanded.push(ExpandedStep {
                    value: step.target,
                    duration_secs: *substep_secs,
                    direction: step.direction,
                    source_step,
                });
            }
        }
        previous = Some(step.target);
    }

    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_step_entry() {
        let step = RecipeStep::parse_line("60 ; 450.0 ; s", 1).unwrap();
        assert_eq!(step.duration_secs, 60.0);
        assert_eq!(step.target, 450.0);
        assert_eq!(step.mode, StepMode::Step);
        assert_eq!(step.direction, None);
    }

    #[test]
    fn parses_ramp_with_direction() {
        let step = RecipeStep::parse_line("600 ; 12.0 ; r ; 30 ; CCW", 2).unwrap();
        assert_eq!(step.mode, StepMode::Ramp { substep_secs: 30.0 });
        assert_eq!(step.direction, Some(Direction::Ccw));
    }

    #[test]
    fn unknown_mode_is_a_hard_error() {
        let err = RecipeStep::parse_line("60 ; 450.0 ; q", 3).unwrap_err();
        assert_eq!(
            err,
            RecipeError::UnknownMode {
                line: 3,
                mode: "q".into()
            }
        );
    }

    #[test]
    fn ramp_without_substep_is_malformed() {
        let err = RecipeStep::parse_line("60 ; 450.0 ; r", 1).unwrap_err();
        assert!(matches!(err, RecipeError::Malformed { line: 1, .. }));
    }

    #[test]
    fn table_skips_blanks_and_comments_keeping_line_numbers() {
        let table = lines(&["", "# heat-up", "60 ; 450.0 ; s", "oops"]);
        let err = parse_table(&table).unwrap_err();
        assert!(matches!(err, RecipeError::Malformed { line: 4, .. }));
    }

    #[test]
    fn ramp_expands_linearly_with_pinned_target() {
        // duration=10, target=5.0, substep=2, starting from 0.0:
        // five sub-steps of 2 s with values 1..5, last exactly 5.0.
        let steps = vec![RecipeStep {
            duration_secs: 10.0,
            target: 5.0,
            mode: StepMode::Ramp { substep_secs: 2.0 },
            direction: None,
        }];
        let expanded = expand(&steps, Some(0.0)).unwrap();
        let values: Vec<f64> = expanded.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert!(expanded.iter().all(|s| s.duration_secs == 2.0));
        assert_eq!(expanded.last().unwrap().value, 5.0);
    }

    #[test]
    fn ramp_first_without_measurement_is_rejected() {
        let steps = vec![RecipeStep {
            duration_secs: 10.0,
            target: 5.0,
            mode: StepMode::Ramp { substep_secs: 2.0 },
            direction: None,
        }];
        assert_eq!(expand(&steps, None).unwrap_err(), RecipeError::NoMeasurement);
    }

    #[test]
    fn later_ramp_starts_from_previous_target() {
        let steps = vec![
            RecipeStep {
                duration_secs: 60.0,
                target: 4.0,
                mode: StepMode::Step,
                direction: None,
            },
            RecipeStep {
                duration_secs: 4.0,
                target: 8.0,
                mode: StepMode::Ramp { substep_secs: 2.0 },
                direction: None,
            },
        ];
        // No start value needed: the leading entry is a plain step.
        let expanded = expand(&steps, None).unwrap();
        let values: Vec<f64> = expanded.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![4.0, 6.0, 8.0]);
    }

    #[test]
    fn ramp_shorter_than_substep_is_invalid() {
        let steps = vec![RecipeStep {
            duration_secs: 1.0,
            target: 5.0,
            mode: StepMode::Ramp { substep_secs: 2.0 },
            direction: None,
        }];
        let err = expand(&steps, Some(0.0)).unwrap_err();
        assert!(matches!(err, RecipeError::InvalidRamp { step: 1, .. }));
    }

    #[test]
    fn descending_ramp_expands_downwards() {
        let steps = vec![RecipeStep {
            duration_secs: 6.0,
            target: 2.0,
            mode: StepMode::Ramp { substep_secs: 2.0 },
            direction: None,
        }];
        let expanded = expand(&steps, Some(8.0)).unwrap();
        let values: Vec<f64> = expanded.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![6.0, 4.0, 2.0]);
    }
}
