use crate::model_service::RawMask;
use std::cmp::Ordering;

fn rank_key(score: f32) -> f32 {
    if score.is_nan() {
        f32::NEG_INFINITY
    } else {
        score
    }
}

fn by_descending_score(a: &RawMask, b: &RawMask) -> Ordering {
    rank_key(b.score).total_cmp(&rank_key(a.score))
}

/// Orders masks by descending score. The sort is stable, so equal scores keep
/// the order the model emitted them in. NaN scores rank last.
pub fn rank(mut masks: Vec<RawMask>) -> Vec<RawMask> {
    masks.sort_by(by_descending_score);
    masks
}
