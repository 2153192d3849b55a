use thiserror::Error;

use crate::db::models::{EventId, GameResult, MarketType, Pick, PickOutcome, Side};

/// Scores and lines are compared with this tolerance.
const EPSILON: f64 = 1e-9;

/// A pick that cannot be graded as recorded.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GradeError {
    #[error("{market} pick has no line")]
    MissingLine { market: MarketType },
    #[error("side {side} is not valid for {market}")]
    SideMismatch { market: MarketType, side: Side },
    #[error("result for event {event_id} is not final")]
    NotFinal { event_id: EventId },
    #[error("pick is on event {pick_event:?} but result is for event {result_event}")]
    EventMismatch {
        pick_event: Option<EventId>,
        result_event: EventId,
    },
}

fn compare(lhs: f64, rhs: f64) -> PickOutcome {
    if (lhs - rhs).abs() < EPSILON {
        PickOutcome::Push
    } else if lhs > rhs {
        PickOutcome::Won
    } else {
        PickOutcome::Lost
    }
}

/// Spread grading from the picked team's side: its score plus its line
/// against the opponent's score.
pub fn grade_margin(pick_team_score: f64, opponent_score: f64, line: f64) -> PickOutcome {
    compare(pick_team_score + line, opponent_score)
}

/// Grade a pick against a final result.
pub fn grade_pick(pick: &Pick, result: &GameResult) -> Result<PickOutcome, GradeError> {
    if pick.event_id != Some(result.event_id) {
        return Err(GradeError::EventMismatch {
            pick_event: pick.event_id,
            result_event: result.event_id,
        });
    }
    if !result.is_final {
        return Err(GradeError::NotFinal {
            event_id: result.event_id,
        });
    }
    if !pick.market_type.accepts(pick.side) {
        return Err(GradeError::SideMismatch {
            market: pick.market_type,
            side: pick.side,
        });
    }

    let home = f64::from(result.home_score);
    let away = f64::from(result.away_score);
    let line = || {
        pick.line.ok_or(GradeError::MissingLine {
            market: pick.market_type,
        })
    };

    let outcome = match (pick.market_type, pick.side) {
        (MarketType::Spread, Side::Home) => grade_margin(home, away, line()?),
        (MarketType::Spread, _) => grade_margin(away, home, line()?),
        (MarketType::Total, Side::Over) => compare(home + away, line()?),
        (MarketType::Total, _) => compare(line()?, home + away),
        (MarketType::Moneyline, side) => {
            if result.home_score == result.away_score {
                PickOutcome::Void
            } else {
                let home_won = result.home_score > result.away_score;
                if home_won == (side == Side::Home) {
                    PickOutcome::Won
                } else {
                    PickOutcome::Lost
                }
            }
        }
    };
    Ok(outcome)
}
