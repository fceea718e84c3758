//! Topic placement planning for chunks.
//!
//! Placement is semantic only: a chunk's heading and body are compared
//! against existing topic nodes and their exemplar chunks with token-set
//! Jaccard over NFC-normalized, diacritic-stripped Arabic tokens. Folder
//! names are never a signal. Every placement is review-gated unless all
//! three confidences clear the configured floor and no new topic node would
//! be created.

use serde::{Deserialize, Serialize};

use crate::config::PlacementConfig;
use crate::models::{ChunkRecord, Decision, OracleVerdict, Suggestion};
use crate::textnorm;

/// Weight of heading similarity vs body similarity in the combined score.
const HEADING_WEIGHT: f64 = 0.65;
const BODY_WEIGHT: f64 = 0.35;

/// Combined score below which no existing topic is considered a match and a
/// new topic node is proposed instead.
const NEW_TOPIC_FLOOR: f64 = 0.3;

/// Display title of the exercises/applications topic family.
pub const EXERCISE_FAMILY_TITLE: &str = "تمارين_وتطبيقات";

/// An exemplar a topic exposes for matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicExemplar {
    pub heading: String,
    pub body: String,
}

/// A topic node as the planner sees it (identity + matching surface).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicNode {
    pub topic_id: String,
    pub title: String,
    #[serde(default)]
    pub exemplars: Vec<TopicExemplar>,
}

/// One ranked topic candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicCandidateScore {
    pub topic_id: String,
    pub score: f64,
    pub heading_similarity: f64,
    pub body_similarity: f64,
}

/// The planner's proposal for one chunk (second-gate artifact content).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementProposal {
    /// `assigned` or `review`.
    pub status: String,
    #[serde(default)]
    pub chosen_topic_id: Option<String>,
    /// Set when no existing topic clears the floor: the title a new node
    /// would get (review-gated by definition).
    #[serde(default)]
    pub proposed_new_topic_title: Option<String>,
    pub boundary_confidence: f64,
    pub topic_purity_confidence: f64,
    pub placement_confidence: f64,
    pub review_required: bool,
    pub reasons: Vec<String>,
    pub candidates: Vec<TopicCandidateScore>,
    pub exercise_family: bool,
}

/// One row of the chunk plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPlanItem {
    pub chunk_id: String,
    pub file: String,
    pub heading: String,
    pub level: u8,
    pub start_offset: usize,
    pub end_offset: usize,
    pub placement: PlacementProposal,
    pub review_required: bool,
}

/// `chunk_plan.proposed.json` / `chunk_plan.approved.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub book_id: String,
    pub run_id: String,
    pub strict_anchor_policy: String,
    /// `proposed` or `approved`.
    pub status: String,
    pub approval_required: bool,
    pub items: Vec<ChunkPlanItem>,
    #[serde(default)]
    pub approved_by: Option<String>,
    #[serde(default)]
    pub approved_at: Option<String>,
}

/// Confidence that the chunk boundary itself is right: the scorer's
/// confidence, raised to the oracle's when both agree the line is a heading.
pub fn boundary_confidence(decision: Option<&Decision>) -> f64 {
    let Some(decision) = decision else {
        return 0.5;
    };
    let rule = decision.score.confidence;
    match (&decision.oracle, decision.score.suggested_is_heading) {
        (Some(OracleVerdict { is_heading: true, confidence, .. }), Suggestion::True) => {
            rule.max(*confidence)
        }
        (Some(OracleVerdict { is_heading: true, confidence, .. }), Suggestion::Unknown) => {
            *confidence
        }
        _ => rule,
    }
}

fn score_against(chunk_heading: &str, chunk_body: &str, topic: &TopicNode) -> TopicCandidateScore {
    let heading_tokens = textnorm::token_set(chunk_heading);
    let body_tokens = textnorm::token_set(chunk_body);

    let mut best_heading = 0.0f64;
    let mut best_body = 0.0f64;

    let exemplars: Vec<TopicExemplar> = if topic.exemplars.is_empty() {
        vec![TopicExemplar {
            heading: topic.title.clone(),
            body: String::new(),
        }]
    } else {
        topic.exemplars.clone()
    };

    for exemplar in &exemplars {
        let exemplar_heading = format!("{} {}", topic.title, exemplar.heading);
        let h = textnorm::jaccard(&heading_tokens, &textnorm::token_set(&exemplar_heading));
        let b = textnorm::jaccard(&body_tokens, &textnorm::token_set(&exemplar.body));
        best_heading = best_heading.max(h);
        best_body = best_body.max(b);
    }

    TopicCandidateScore {
        topic_id: topic.topic_id.clone(),
        score: HEADING_WEIGHT * best_heading + BODY_WEIGHT * best_body,
        heading_similarity: best_heading,
        body_similarity: best_body,
    }
}

/// Propose a placement for one chunk against the topic registry.
pub fn propose_placement(
    chunk: &ChunkRecord,
    boundary_confidence: f64,
    topics: &[TopicNode],
    cfg: &PlacementConfig,
) -> PlacementProposal {
    let exercise = textnorm::is_exercise_text(&chunk.heading);

    let mut ranked: Vec<TopicCandidateScore> = topics
        .iter()
        .map(|t| score_against(&chunk.heading, &chunk.body, t))
        .collect();
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.topic_id.cmp(&b.topic_id))
    });
    ranked.truncate(cfg.max_candidates);

    let top = ranked.first().cloned();
    let second = ranked.get(1).cloned();

    // Purity: how much the body leans toward one topic rather than several.
    let topic_purity_confidence = match (&top, &second) {
        (Some(t), Some(s)) if t.body_similarity > 0.0 => {
            (1.0 - s.body_similarity / t.body_similarity.max(f64::EPSILON)).clamp(0.0, 1.0)
        }
        (Some(_), None) => 1.0,
        _ => 0.5,
    };

    // Placement: the margin between the top two candidates.
    let placement_confidence = match (&top, &second) {
        (Some(t), Some(s)) if t.score > 0.0 => ((t.score - s.score) / t.score).clamp(0.0, 1.0),
        (Some(t), None) if t.score > 0.0 => 1.0,
        _ => 0.0,
    };

    let mut reasons: Vec<String> = Vec::new();
    let creates_new_topic = top.as_ref().map(|t| t.score < NEW_TOPIC_FLOOR).unwrap_or(true);
    if creates_new_topic {
        reasons.push("no_existing_topic_clears_floor".into());
    }
    if boundary_confidence < cfg.min_confidence {
        reasons.push("boundary_confidence_below_threshold".into());
    }
    if topic_purity_confidence < cfg.min_confidence {
        reasons.push("topic_purity_below_threshold".into());
    }
    if placement_confidence < cfg.min_confidence {
        reasons.push("placement_margin_below_threshold".into());
    }
    if let (Some(t), Some(s)) = (&top, &second) {
        if (t.score - s.score) < cfg.ambiguity_margin {
            reasons.push("ambiguous_top_candidates".into());
        }
    }
    if exercise {
        reasons.push("exercise_family_default".into());
    }

    let review_required = !reasons.is_empty();
    let status = if review_required { "review" } else { "assigned" };

    let chosen_topic_id = if exercise || creates_new_topic {
        None
    } else {
        top.as_ref().map(|t| t.topic_id.clone())
    };
    let proposed_new_topic_title = if exercise {
        Some(EXERCISE_FAMILY_TITLE.to_string())
    } else if creates_new_topic {
        Some(new_topic_title(&chunk.heading))
    } else {
        None
    };

    PlacementProposal {
        status: status.to_string(),
        chosen_topic_id,
        proposed_new_topic_title,
        boundary_confidence,
        topic_purity_confidence,
        placement_confidence,
        review_required,
        reasons,
        candidates: ranked,
        exercise_family: exercise,
    }
}

fn new_topic_title(heading: &str) -> String {
    let normalized = textnorm::normalize(heading);
    if normalized.is_empty() {
        "موضوع".to_string()
    } else {
        normalized
    }
}
