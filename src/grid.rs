//! Display geometry of the weekly grid.
//!
//! The grid always shows periods 1 through 8. A single synthetic break slot is
//! injected right after the configured period. The break carries no schedule
//! data and is never handed to the conflict checker; its sort position is
//! `after + 0.5`, which can never collide with a real (integral) period.

use crate::models::Period;
use serde::{Deserialize, Serialize};

pub const ALLOWED_BREAK_POSITIONS: [u8; 2] = [3, 4];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum SlotLabel {
    Period { period: Period },
    Break { after: u8 },
}

impl SlotLabel {
    /// Fractional sort key: `n` for period `n`, `p + 0.5` for a break after `p`.
    pub fn position(self) -> f32 {
        match self {
            Self::Period { period } => f32::from(period.get()),
            Self::Break { after } => f32::from(after) + 0.5,
        }
    }

    pub fn period(self) -> Option<Period> {
        match self {
            Self::Period { period } => Some(period),
            Self::Break { .. } => None,
        }
    }

    pub fn is_break(self) -> bool {
        matches!(self, Self::Break { .. })
    }
}

/// Ordered display slots for a break placed after `break_after_period`.
///
/// No validation happens here; a value outside the period range just means no
/// break gets emitted. The allowed domain is enforced where the setting is written.
pub fn resolve_slots(break_after_period: u8) -> Vec<SlotLabel> {
    let mut slots = Vec::with_capacity(usize::from(Period::LAST) + 1);
    for period in Period::all() {
        slots.push(SlotLabel::Period { period });
        if period.get() == break_after_period {
            slots.push(SlotLabel::Break {
                after: break_after_period,
            });
        }
    }
    slots
}

pub fn is_allowed_break_position(value: u8) -> bool {
    ALLOWED_BREAK_POSITIONS.contains(&value)
}

#[cfg(test)]
mod tests {
    use super::{is_allowed_break_position, resolve_slots, SlotLabel};

    fn positions(break_after: u8) -> Vec<f32> {
        resolve_slots(break_after)
            .into_iter()
            .map(SlotLabel::position)
            .collect()
    }

    #[test]
    fn break_after_third_period() {
        assert_eq!(
            positions(3),
            vec![1.0, 2.0, 3.0, 3.5, 4.0, 5.0, 6.0, 7.0, 8.0]
        );
    }

    #[test]
    fn break_after_fourth_period() {
        assert_eq!(
            positions(4),
            vec![1.0, 2.0, 3.0, 4.0, 4.5, 5.0, 6.0, 7.0, 8.0]
        );
    }

    #[test]
    fn out_of_domain_values_still_resolve() {
        let slots = resolve_slots(6);
        assert_eq!(slots.len(), 9);
        assert_eq!(slots.iter().filter(|slot| slot.is_break()).count(), 1);

        let without_break = resolve_slots(0);
        assert_eq!(without_break.len(), 8);
        assert!(without_break.iter().all(|slot| slot.period().is_some()));
    }

    #[test]
    fn positions_are_strictly_increasing() {
        for break_after in 0..=9 {
            let sequence = positions(break_after);
            assert!(sequence.windows(2).all(|pair| pair[0] < pair[1]));
        }
    }

    #[test]
    fn only_third_and_fourth_are_allowed() {
        assert!(is_allowed_break_position(3));
        assert!(is_allowed_break_position(4));
        assert!(!is_allowed_break_position(5));
        assert!(!is_allowed_break_position(0));
    }
}
