//! The mutator catalogue: strategies are registered by id with plain
//! metadata and a function value, not as a `Box<dyn Trait>` hierarchy. New
//! strategies are added by extending the match arms below, which keeps the
//! full catalogue readable in one place instead of scattered across structs.

use std::sync::Arc;

use crate::llm::Gateway;

use super::llm_assisted;
use super::transforms;
use super::types::{AttackerTrace, Feedback, Mutation, MutatorError, MutatorFamily, MutatorMeta};

const CATALOGUE: &[MutatorMeta] = &[
    MutatorMeta {
        id: "base64_wrap",
        family: MutatorFamily::Deterministic,
        requires_feedback: false,
    },
    MutatorMeta {
        id: "rot13",
        family: MutatorFamily::Deterministic,
        requires_feedback: false,
    },
    MutatorMeta {
        id: "homoglyph",
        family: MutatorFamily::Deterministic,
        requires_feedback: false,
    },
    MutatorMeta {
        id: "context_flooding",
        family: MutatorFamily::Deterministic,
        requires_feedback: false,
    },
    MutatorMeta {
        id: "roleplay_injection",
        family: MutatorFamily::LlmAssisted,
        requires_feedback: false,
    },
    MutatorMeta {
        id: "crescendo",
        family: MutatorFamily::LlmAssisted,
        requires_feedback: true,
    },
    MutatorMeta {
        id: "many_shot_jailbreak",
        family: MutatorFamily::LlmAssisted,
        requires_feedback: false,
    },
    MutatorMeta {
        id: "skeleton_key",
        family: MutatorFamily::LlmAssisted,
        requires_feedback: false,
    },
];

/// List every registered strategy's metadata.
pub fn catalogue() -> &'static [MutatorMeta] {
    CATALOGUE
}

pub fn meta_for(strategy_id: &str) -> Option<&'static MutatorMeta> {
    CATALOGUE.iter().find(|m| m.id == strategy_id)
}

/// Apply a registered strategy by id. LLM-assisted strategies call through
/// `gateway`; deterministic strategies ignore it entirely.
pub async fn apply(
    strategy_id: &str,
    gateway: &Arc<Gateway>,
    experiment_id: &str,
    iteration: u32,
    seed: &str,
    feedback: &Feedback,
) -> Result<Mutation, MutatorError> {
    let meta = meta_for(strategy_id)
        .ok_or_else(|| MutatorError::UnknownStrategy(strategy_id.to_string()))?;

    // `requires_feedback` strategies (currently only crescendo) still produce
    // a valid mutation with no prior feedback; they self-seed their first
    // message instead of erroring out.

    let (prompt, trace): (String, Option<AttackerTrace>) = match meta.id {
        "base64_wrap" => (transforms::base64_wrap(seed)?, None),
        "rot13" => (transforms::rot13(seed)?, None),
        "homoglyph" => (transforms::homoglyph(seed)?, None),
        "context_flooding" => (transforms::context_flooding(seed)?, None),
        "roleplay_injection" => {
            let (prompt, trace) =
                llm_assisted::roleplay_injection(gateway, experiment_id, iteration, seed).await?;
            (prompt, Some(trace))
        }
        "crescendo" => {
            let (prompt, trace) =
                llm_assisted::crescendo(gateway, experiment_id, iteration, seed, feedback).await?;
            (prompt, Some(trace))
        }
        "many_shot_jailbreak" => {
            let (prompt, trace) =
                llm_assisted::many_shot_jailbreak(gateway, experiment_id, iteration, seed).await?;
            (prompt, Some(trace))
        }
        "skeleton_key" => {
            let (prompt, trace) =
                llm_assisted::skeleton_key(gateway, experiment_id, iteration, seed).await?;
            (prompt, Some(trace))
        }
        other => return Err(MutatorError::UnknownStrategy(other.to_string())),
    };

    // Every registered strategy is non-identity-capable today; a mutation
    // that leaves the prompt byte-identical to the seed would silently
    // violate that contract instead of engaging the fallback policy.
    if prompt == seed {
        return Err(MutatorError::StrategyFailed(
            meta.id,
            "mutation output is identical to the input prompt".to_string(),
        ));
    }

    Ok(Mutation {
        strategy_id: meta.id,
        input: seed.to_string(),
        prompt,
        trace,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn catalogue_ids_are_unique() {
        let mut ids: Vec<_> = CATALOGUE.iter().map(|m| m.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), CATALOGUE.len());
    }

    #[tokio::test]
    async fn unknown_strategy_id_is_rejected() {
        let gateway = Arc::new(Gateway::new(HashMap::new()));
        let result = apply(
            "not_a_real_strategy",
            &gateway,
            "exp-1",
            0,
            "seed",
            &Feedback::default(),
        )
        .await;
        assert!(matches!(result, Err(MutatorError::UnknownStrategy(_))));
    }

    #[tokio::test]
    async fn deterministic_strategy_runs_without_a_live_gateway() {
        let gateway = Arc::new(Gateway::new(HashMap::new()));
        let mutation = apply(
            "base64_wrap",
            &gateway,
            "exp-1",
            0,
            "seed prompt",
            &Feedback::default(),
        )
        .await
        .unwrap();
        assert_eq!(mutation.strategy_id, "base64_wrap");
    }

    #[tokio::test]
    async fn strategy_requiring_feedback_still_attempts_without_it() {
        // No Attacker client is configured, so this fails at the gateway call,
        // not at a missing-feedback precheck - crescendo must at least try to
        // seed itself on iteration 0 rather than being rejected up front.
        let gateway = Arc::new(Gateway::new(HashMap::new()));
        let result = apply("crescendo", &gateway, "exp-1", 0, "seed", &Feedback::default()).await;
        assert!(matches!(result, Err(MutatorError::StrategyFailed(_, _))));
    }

    #[tokio::test]
    async fn homoglyph_with_no_substitutable_letters_is_a_strategy_failure_not_an_identity_mutation() {
        let gateway = Arc::new(Gateway::new(HashMap::new()));
        let result = apply("homoglyph", &gateway, "exp-1", 0, "SHY GUY", &Feedback::default()).await;
        assert!(matches!(result, Err(MutatorError::StrategyFailed("homoglyph", _))));
    }

    #[tokio::test]
    async fn deterministic_mutation_carries_input_and_no_trace() {
        let gateway = Arc::new(Gateway::new(HashMap::new()));
        let mutation = apply(
            "rot13",
            &gateway,
            "exp-1",
            0,
            "seed prompt",
            &Feedback::default(),
        )
        .await
        .unwrap();
        assert_eq!(mutation.input, "seed prompt");
        assert!(mutation.trace.is_none());
    }
}
