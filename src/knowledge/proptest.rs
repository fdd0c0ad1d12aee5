//! Property-based tests for knowledge evolution.
//!
//! Random sequences of extractions must preserve:
//!
//! - confidence within [0, 1] for every knowledge node
//! - an acyclic SUPERSEDES relation
//! - at most one head per concept
//! - strictly increasing reuse counts on reinforcement

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use proptest::prelude::*;

    use crate::experience::{AgentId, ExperienceId, ExperienceStore, ExperienceType};
    use crate::graph::{EdgeType, GraphStore, NodeFilter, NodeType};
    use crate::knowledge::types::{ExtractionAction, ExtractionMode, ExtractionRequest, Knowledge};
    use crate::knowledge::{reinforce_confidence, HierarchicalMemoryManager};

    const CONCEPTS: [&str; 3] = ["sql-injection", "caching", "auth"];
    const DESCRIPTIONS: [&str; 4] = [
        "string concat in queries is risky",
        "always use parameterized statements",
        "invalidate entries on write",
        "tokens expire after one hour",
    ];

    #[derive(Debug, Clone)]
    struct Step {
        concept: usize,
        description: usize,
        confidence: f64,
        mode: ExtractionMode,
        source: usize,
    }

    fn mode() -> impl Strategy<Value = ExtractionMode> {
        prop_oneof![
            Just(ExtractionMode::Auto),
            Just(ExtractionMode::Reinforce),
            Just(ExtractionMode::Update),
        ]
    }

    fn confidence() -> impl Strategy<Value = f64> {
        prop_oneof![Just(0.0), Just(1.0), 0.0f64..=1.0f64]
    }

    fn step() -> impl Strategy<Value = Step> {
        (0..CONCEPTS.len(), 0..DESCRIPTIONS.len(), confidence(), mode(), 0..4usize).prop_map(
            |(concept, description, confidence, mode, source)| Step {
                concept,
                description,
                confidence,
                mode,
                source,
            },
        )
    }

    struct World {
        graph: Arc<GraphStore>,
        manager: HierarchicalMemoryManager,
        sources: Vec<ExperienceId>,
    }

    fn world() -> World {
        let graph = Arc::new(GraphStore::in_memory().unwrap());
        let experiences = ExperienceStore::new(Arc::clone(&graph));
        let session = experiences
            .start_session(&AgentId::new("prop"), "explore")
            .unwrap()
            .id;
        let sources = (0..4)
            .map(|i| {
                experiences
                    .record_experience(
                        &session,
                        ExperienceType::Observation,
                        &format!("observation {}", i),
                        Vec::<String>::new(),
                    )
                    .unwrap()
                    .id
            })
            .collect();
        World {
            manager: HierarchicalMemoryManager::new(Arc::clone(&graph)),
            graph,
            sources,
        }
    }

    fn all_knowledge(graph: &GraphStore) -> Vec<Knowledge> {
        graph
            .read(|view| {
                view.find_nodes(&NodeFilter::of_type(NodeType::Knowledge))?
                    .iter()
                    .map(Knowledge::from_node)
                    .collect()
            })
            .unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        /// Invariants hold after every extraction in a random sequence.
        #[test]
        fn extraction_sequences_preserve_invariants(
            steps in prop::collection::vec(step(), 1..24)
        ) {
            let world = world();

            for step in steps {
                let concept = CONCEPTS[step.concept];
                let before = world.manager.current_head(concept).unwrap();

                let outcome = world
                    .manager
                    .extract_knowledge(
                        ExtractionRequest::new(
                            concept,
                            DESCRIPTIONS[step.description],
                            vec![world.sources[step.source].clone()],
                            step.confidence,
                        )
                        .with_mode(step.mode),
                    )
                    .unwrap();

                if outcome.action == ExtractionAction::Reinforced {
                    let before = before.expect("reinforcement needs a head");
                    let after = world.manager.get_knowledge(&outcome.knowledge_id).unwrap();
                    prop_assert!(after.reuse_count > before.reuse_count);
                    prop_assert!(after.confidence >= before.confidence);
                }
                prop_assert!(outcome.warnings.is_empty());

                for knowledge in all_knowledge(&world.graph) {
                    prop_assert!(
                        (0.0..=1.0).contains(&knowledge.confidence),
                        "confidence {} out of range",
                        knowledge.confidence
                    );
                }

                let mut heads_per_concept: HashMap<String, usize> = HashMap::new();
                for head in world.manager.heads().unwrap() {
                    *heads_per_concept.entry(head.concept).or_default() += 1;
                }
                prop_assert!(heads_per_concept.values().all(|&n| n == 1));
            }

            let acyclic = world
                .graph
                .read(|view| {
                    for node in view.find_nodes(&NodeFilter::of_type(NodeType::Knowledge))? {
                        for edge in view.edges_from(&node.id, Some(EdgeType::Supersedes))? {
                            if view.reachable(&edge.to, &edge.from, EdgeType::Supersedes)? {
                                return Ok(false);
                            }
                        }
                    }
                    Ok(true)
                })
                .unwrap();
            prop_assert!(acyclic);
        }

        /// Reinforcement never leaves [0, 1] and never decreases confidence.
        #[test]
        fn reinforcement_is_monotone_and_bounded(
            c in 0.0f64..=1.0f64,
            rate in 0.0f64..=1.0f64
        ) {
            let next = reinforce_confidence(c, rate);
            prop_assert!((0.0..=1.0).contains(&next));
            prop_assert!(next >= c);
        }
    }
}
