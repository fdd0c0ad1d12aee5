//! End-to-end behaviour through the capability-checked façade.

use std::collections::BTreeSet;

use agent_memory::graph::{EdgeType, NodeType};
use agent_memory::{
    CapabilityManifest, CodeFile, CodeSymbol, Error, ExperienceType, ExtractionAction,
    ExtractionRequest, KnowledgeStatus, MemoryConfig, MemorySystem, RetrievalQuery, Scope,
    SessionOutcome,
};
use pretty_assertions::assert_eq;

fn system_with(manifest: CapabilityManifest) -> MemorySystem {
    let system = MemorySystem::in_memory().unwrap();
    system.register_manifest(manifest).unwrap();
    system
}

fn writer(agent: &str) -> CapabilityManifest {
    CapabilityManifest::new(agent, Scope::Session).write_knowledge(true)
}

#[test]
fn reinforcing_extraction_raises_confidence_and_reuse() {
    let system = system_with(writer("reviewer"));
    let agent = system.agent("reviewer");
    let session = agent.start_session("Audit the report queries").unwrap();
    let e1 = agent
        .record_experience(
            &session.id,
            ExperienceType::Observation,
            "report builder concatenates user input into SQL",
            ["security"],
        )
        .unwrap();

    let first = agent
        .extract_knowledge(ExtractionRequest::new(
            "sql-injection",
            "string concat in queries is risky",
            vec![e1.id.clone()],
            0.8,
        ))
        .unwrap();
    assert_eq!(first.action, ExtractionAction::Created);

    let history = agent.knowledge_history(&first.knowledge_id).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].confidence, 0.8);
    assert_eq!(history[0].reuse_count, 0);

    let second = agent
        .extract_knowledge(
            ExtractionRequest::new(
                "sql-injection",
                "string concat in queries is risky",
                vec![e1.id],
                0.8,
            )
            .reinforcing(),
        )
        .unwrap();
    assert_eq!(second.action, ExtractionAction::Reinforced);
    assert_eq!(second.knowledge_id, first.knowledge_id);

    let head = &agent.knowledge_history(&first.knowledge_id).unwrap()[0];
    assert!((head.confidence - 0.9).abs() < 1e-12);
    assert_eq!(head.reuse_count, 1);
}

#[test]
fn update_supersedes_and_retrieval_returns_new_head() {
    let system = system_with(writer("reviewer"));
    let agent = system.agent("reviewer");
    let session = agent.start_session("Audit the report queries").unwrap();
    let e1 = agent
        .record_experience(
            &session.id,
            ExperienceType::Observation,
            "report builder concatenates user input into SQL",
            Vec::<String>::new(),
        )
        .unwrap();

    let old = agent
        .extract_knowledge(ExtractionRequest::new(
            "sql-injection",
            "string concat in queries is risky",
            vec![e1.id.clone()],
            0.8,
        ))
        .unwrap();
    let new = agent
        .extract_knowledge(
            ExtractionRequest::new(
                "sql-injection",
                "always use bound parameters via prepared statements",
                vec![e1.id],
                0.7,
            )
            .updating(),
        )
        .unwrap();
    assert_eq!(
        new.action,
        ExtractionAction::Superseded {
            previous: old.knowledge_id.clone()
        }
    );

    let hits = agent
        .retrieve_knowledge(RetrievalQuery::new("sql injection").top_k(1))
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].knowledge.id, new.knowledge_id);
    assert!(hits[0].is_current());

    let with_history = agent
        .retrieve_knowledge(RetrievalQuery::new("sql injection").include_history(true))
        .unwrap();
    let old_hit = with_history
        .iter()
        .find(|hit| hit.knowledge.id == old.knowledge_id)
        .unwrap();
    assert_eq!(
        old_hit.status,
        KnowledgeStatus::Superseded {
            by: new.knowledge_id.clone()
        }
    );

    let chain = agent.knowledge_history(&new.knowledge_id).unwrap();
    let ids: Vec<_> = chain.iter().map(|k| k.id.clone()).collect();
    assert_eq!(ids, vec![new.knowledge_id, old.knowledge_id]);
    assert_eq!(system.graph().stats().unwrap().edges(EdgeType::Supersedes), 1);
}

#[test]
fn out_of_scope_write_is_rejected_and_audited() {
    let system = MemorySystem::in_memory().unwrap();
    system
        .register_manifest(CapabilityManifest::new("owner", Scope::Session))
        .unwrap();
    let owner = system.agent("owner");
    let s1 = owner.start_session("first").unwrap();
    let s2 = owner.start_session("second").unwrap();

    system
        .register_manifest(CapabilityManifest::new("guest", Scope::Session).allow_session(s1.id.clone()))
        .unwrap();
    let guest = system.agent("guest");

    let err = guest
        .record_experience(&s2.id, ExperienceType::Action, "sneaky write", ["x"])
        .unwrap_err();
    assert!(matches!(err, Error::Permission { .. }));

    let last = system.audit().records().unwrap().pop().unwrap();
    assert_eq!(last.agent_id, "guest");
    assert_eq!(last.operation, "record_experience");
    assert_eq!(last.session_id, Some(s2.id.to_string()));
    assert!(!last.success);
    assert!(last.error.unwrap().starts_with("permission"));
    assert!(owner.get_session_experiences(&s2.id).unwrap().is_empty());

    // The listed session is writable
    guest
        .record_experience(&s1.id, ExperienceType::Action, "allowed write", ["x"])
        .unwrap();
}

#[test]
fn credentials_are_scrubbed_before_persistence() {
    let system = system_with(CapabilityManifest::new("ops", Scope::Session));
    let agent = system.agent("ops");
    let session = agent.start_session("Rotate keys").unwrap();

    let experience = agent
        .record_experience(
            &session.id,
            ExperienceType::Action,
            "api_key=sk-abc123",
            ["deploy"],
        )
        .unwrap();
    assert_eq!(experience.content, "api_key=[REDACTED]");
    assert!(experience.has_tag("contains_redacted_credentials"));

    let last = system.audit().records().unwrap().pop().unwrap();
    assert_eq!(last.operation, "record_experience");
    assert!(last.scrubbed);
    assert!(!serde_json::to_string(&last).unwrap().contains("sk-abc123"));

    let stored = agent.get_session_experiences(&session.id).unwrap();
    assert_eq!(stored[0].content, "api_key=[REDACTED]");
}

#[test]
fn quoted_credentials_in_structured_text_are_scrubbed() {
    let system = system_with(CapabilityManifest::new("ops", Scope::Session));
    let agent = system.agent("ops");
    let session = agent.start_session("Rotate keys").unwrap();

    let experience = agent
        .record_experience(
            &session.id,
            ExperienceType::Observation,
            r#"{"password": "hunter2", "user": "bob"}"#,
            ["config"],
        )
        .unwrap();
    assert_eq!(experience.content, r#"{"password": "[REDACTED]", "user": "bob"}"#);
    assert!(experience.has_tag("contains_redacted_credentials"));

    let yaml = agent
        .record_experience(
            &session.id,
            ExperienceType::Observation,
            "db:\n  client_secret: abc123",
            ["config"],
        )
        .unwrap();
    assert_eq!(yaml.content, "db:\n  client_secret: [REDACTED]");

    let stored = agent.get_session_experiences(&session.id).unwrap();
    assert!(stored.iter().all(|e| !e.content.contains("hunter2") && !e.content.contains("abc123")));
    assert!(system.audit().records().unwrap().iter().all(|r| {
        let line = serde_json::to_string(r).unwrap();
        !line.contains("hunter2") && !line.contains("abc123")
    }));
}

#[test]
fn caller_tags_round_trip_verbatim() {
    let system = system_with(CapabilityManifest::new("ops", Scope::Session));
    let agent = system.agent("ops");
    let session = agent.start_session("Release").unwrap();
    agent
        .record_experience(&session.id, ExperienceType::Action, "ran cargo test", ["Manual"])
        .unwrap();

    let stored = agent.get_session_experiences(&session.id).unwrap();
    assert!(stored[0].has_tag("Manual"));
    assert!(!stored[0].has_tag("manual"));
}

#[test]
fn unrepresentable_query_time_is_rejected_at_registration() {
    let system = MemorySystem::in_memory().unwrap();
    let err = system
        .register_manifest(CapabilityManifest::new("reader", Scope::Global).with_limits(100, 1e300))
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    // No manifest was stored, so reads fail closed instead of running
    let err = system
        .agent("reader")
        .retrieve_knowledge(RetrievalQuery::new("anything"))
        .unwrap_err();
    assert!(matches!(err, Error::Permission { .. }));
}

#[test]
fn concurrent_extraction_keeps_a_single_head() {
    let system = system_with(writer("crew"));
    let agent = system.agent("crew");
    let session = agent.start_session("Harden queries").unwrap();
    let sources: Vec<_> = (0..8)
        .map(|i| {
            agent
                .record_experience(
                    &session.id,
                    ExperienceType::Observation,
                    &format!("report query {} concatenates user input", i),
                    ["security"],
                )
                .unwrap()
                .id
        })
        .collect();

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = sources
            .iter()
            .enumerate()
            .map(|(i, source)| {
                let agent = &agent;
                scope.spawn(move || {
                    let request = ExtractionRequest::new(
                        "sql-injection",
                        format!("variant {} of the query advice", i),
                        vec![source.clone()],
                        0.6,
                    );
                    let request = if i % 2 == 0 { request.updating() } else { request };
                    agent.extract_knowledge(request)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut created = 0;
    let mut superseded = 0;
    for result in &results {
        match result {
            Ok(outcome) => match outcome.action {
                ExtractionAction::Created => created += 1,
                ExtractionAction::Superseded { .. } => superseded += 1,
                _ => {}
            },
            Err(err) => assert!(
                matches!(err, Error::ConcurrencyConflict { .. }),
                "unexpected error: {}",
                err
            ),
        }
    }
    assert_eq!(created, 1);

    let summary = agent.get_memory_summary().unwrap();
    let concept = &summary.concepts["sql-injection"];
    assert_eq!(concept.heads, 1);
    assert_eq!(concept.versions, 1 + superseded);
    assert_eq!(summary.knowledge_heads, 1);
}

#[test]
fn expired_deadline_fails_reads_without_partial_results() {
    let system = MemorySystem::in_memory().unwrap();
    system
        .register_manifest(
            CapabilityManifest::new("indexer", Scope::Global)
                .allow_code("src/**")
                .write_knowledge(true),
        )
        .unwrap();
    let agent = system.agent("indexer");

    let mut file = CodeFile::new("src/main.rs").language("rust");
    for i in 0..20 {
        file = file.import(format!("src/dep{}.rs", i));
    }
    agent.index_code(&file).unwrap();

    let session = agent.start_session("Learn the layout").unwrap();
    let exp = agent
        .record_experience(&session.id, ExperienceType::Observation, "module layout notes", ["layout"])
        .unwrap();
    for i in 0..20 {
        agent
            .extract_knowledge(ExtractionRequest::new(
                format!("module {}", i),
                "module layout notes",
                vec![exp.id.clone()],
                0.5,
            ))
            .unwrap();
    }
    let before = system.graph().stats().unwrap();

    system
        .register_manifest(
            CapabilityManifest::new("indexer", Scope::Global)
                .allow_code("src/**")
                .with_limits(1_000_000, 1e-9),
        )
        .unwrap();

    let err = agent.query_code_context("src/main.rs", 2).unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));
    let last = system.audit().records().unwrap().pop().unwrap();
    assert_eq!(last.operation, "query_code_context");
    assert!(!last.success);
    assert!(last.error.unwrap().starts_with("timeout"));

    let err = agent
        .retrieve_knowledge(RetrievalQuery::new("module layout notes").top_k(50))
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));
    let last = system.audit().records().unwrap().pop().unwrap();
    assert_eq!(last.operation, "retrieve_knowledge");
    assert!(!last.success);

    assert_eq!(system.graph().stats().unwrap(), before);
}

#[test]
fn over_budget_code_query_fails_without_side_effects() {
    let system = MemorySystem::in_memory().unwrap();
    system
        .register_manifest(
            CapabilityManifest::new("indexer", Scope::Global)
                .allow_code("src/**")
                .with_limits(5, 5.0),
        )
        .unwrap();
    let agent = system.agent("indexer");

    let mut file = CodeFile::new("src/main.rs").language("rust");
    for i in 0..10 {
        file = file.import(format!("src/dep{}.rs", i));
    }
    agent.index_code(&file).unwrap();
    let before = system.graph().stats().unwrap();

    let err = agent.query_code_context("src/main.rs", 2).unwrap_err();
    assert!(matches!(err, Error::QueryCostExceeded { budget: 5, .. }));
    assert_eq!(system.graph().stats().unwrap(), before);

    system
        .register_manifest(
            CapabilityManifest::new("indexer", Scope::Global)
                .allow_code("src/**")
                .with_limits(1_000, 5.0),
        )
        .unwrap();
    let context = agent.query_code_context("src/main.rs", 2).unwrap();
    assert_eq!(context.entities.len(), 10);
}

#[test]
fn code_scope_filters_paths() {
    let system = MemorySystem::in_memory().unwrap();
    system
        .register_manifest(CapabilityManifest::new("coder", Scope::Session).allow_code("src/**"))
        .unwrap();
    let agent = system.agent("coder");

    agent
        .index_code(
            &CodeFile::new("src/auth.rs")
                .import("vendor/crypto.rs")
                .symbol(CodeSymbol::function("login")),
        )
        .unwrap();
    assert!(matches!(
        agent.index_code(&CodeFile::new("secrets/keys.rs")),
        Err(Error::Permission { .. })
    ));

    let context = agent.query_code_context("src/auth.rs", 1).unwrap();
    assert_eq!(context.root.path, "src/auth.rs");
    assert_eq!(context.of_kind(NodeType::Function).count(), 1);
    assert!(context.paths().iter().all(|p| p.starts_with("src/")));
}

#[test]
fn session_scope_hides_foreign_knowledge() {
    let system = MemorySystem::in_memory().unwrap();
    system.register_manifest(writer("a")).unwrap();
    system.register_manifest(writer("b")).unwrap();
    let a = system.agent("a");
    let b = system.agent("b");

    let session = a.start_session("a's work").unwrap();
    let exp = a
        .record_experience(&session.id, ExperienceType::Outcome, "cache warmup fixed latency", ["performance"])
        .unwrap();
    let outcome = a
        .extract_knowledge(ExtractionRequest::new(
            "cache warmup",
            "warming the cache at boot removes latency spikes",
            vec![exp.id.clone()],
            0.6,
        ))
        .unwrap();

    assert!(b
        .retrieve_knowledge(RetrievalQuery::new("cache latency"))
        .unwrap()
        .is_empty());
    assert!(matches!(
        b.knowledge_history(&outcome.knowledge_id),
        Err(Error::Permission { .. })
    ));
    // b cannot extract from a's experiences either
    assert!(matches!(
        b.extract_knowledge(ExtractionRequest::new("x", "y", vec![exp.id], 0.5)),
        Err(Error::Permission { .. })
    ));
    assert_eq!(a.retrieve_knowledge(RetrievalQuery::new("cache latency")).unwrap().len(), 1);
}

#[test]
fn knowledge_writes_require_permission() {
    let system = system_with(CapabilityManifest::new("reader", Scope::Session));
    let agent = system.agent("reader");
    let session = agent.start_session("look around").unwrap();
    let exp = agent
        .record_experience(&session.id, ExperienceType::Observation, "saw something", ["x"])
        .unwrap();

    let err = agent
        .extract_knowledge(ExtractionRequest::new("c", "d", vec![exp.id], 0.5))
        .unwrap_err();
    assert!(matches!(err, Error::Permission { .. }));
    assert_eq!(system.graph().stats().unwrap().nodes(NodeType::Knowledge), 0);
}

#[test]
fn summary_counts_visible_memory() {
    let system = system_with(writer("planner"));
    let agent = system.agent("planner");
    let session = agent.start_session("Ship the release").unwrap();
    let exp = agent
        .record_experience(&session.id, ExperienceType::Action, "ran cargo test", ["testing"])
        .unwrap();
    let knowledge = agent
        .extract_knowledge(ExtractionRequest::new(
            "release checks",
            "run the full test suite before tagging",
            vec![exp.id],
            0.5,
        ))
        .unwrap();
    agent.apply_knowledge(&session.id, &knowledge.knowledge_id).unwrap();
    agent
        .finalize_session(&session.id, SessionOutcome::new("released", true).with_metric("duration_s", 42.0))
        .unwrap();

    let summary = agent.get_memory_summary().unwrap();
    assert_eq!(summary.total_sessions, 1);
    assert_eq!(summary.finalized_sessions, 1);
    assert_eq!(summary.total_experiences, 1);
    assert_eq!(summary.knowledge_heads, 1);
    assert_eq!(summary.concepts["release checks"].reuse_count, 1);

    let err = agent
        .record_experience(&session.id, ExperienceType::Action, "too late", ["x"])
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
}

#[test]
fn file_backed_memory_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = MemoryConfig::for_namespace(dir.path(), "planner");

    let session_id = {
        let system = MemorySystem::open(config.clone()).unwrap();
        system.register_manifest(writer("planner")).unwrap();
        let agent = system.agent("planner");
        let session = agent.start_session("persisted goal").unwrap();
        agent
            .record_experience(&session.id, ExperienceType::Observation, "first", ["x"])
            .unwrap();
        agent
            .record_experience(&session.id, ExperienceType::Observation, "second", ["x"])
            .unwrap();
        session.id
    };

    let system = MemorySystem::open(config.clone()).unwrap();
    system
        .register_manifest(writer("planner").allow_session(session_id.clone()))
        .unwrap();
    let contents: Vec<_> = system
        .agent("planner")
        .get_session_experiences(&session_id)
        .unwrap()
        .into_iter()
        .map(|e| e.content)
        .collect();
    assert_eq!(contents, vec!["first".to_string(), "second".to_string()]);

    let records = agent_memory::audit::read_records(config.audit_path.unwrap()).unwrap();
    let operations: BTreeSet<_> = records.iter().map(|r| r.operation.as_str()).collect();
    assert!(operations.contains("start_session"));
    assert_eq!(records.len(), 4);
}
