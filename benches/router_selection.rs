use std::collections::{HashMap, HashSet};

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;

use portrait::domain::models::{
    Domain, EnergyDynamic, FatigueLevel, FatigueSnapshot, Question, QuestionCatalog, QuestionId, Session,
    SessionState,
};
use portrait::services::QuestionRouter;

fn catalog(size: usize) -> QuestionCatalog {
    let questions = (0..size)
        .map(|i| Question {
            id: QuestionId::new(format!("q-{i:05}")),
            domain: Domain::ALL[i % Domain::ALL.len()],
            text: format!("Question {i}?"),
            depth_level: (i % 5) as u8 + 1,
            energy_dynamic: EnergyDynamic::ALL[i % EnergyDynamic::ALL.len()],
            complexity: (i % 4) as u8 + 1,
            emotional_weight: (i % 5) as u8 + 1,
            safety_level: (i % 3) as u8 + 2,
            trust_requirement: (i % 3) as u8 + 1,
            connections: vec![QuestionId::new(format!("q-{:05}", (i + 7) % size))],
            active: true,
            flagged: false,
        })
        .collect();
    QuestionCatalog::new(questions)
}

/// A session a third of the way through the catalog.
fn state(catalog_size: usize) -> SessionState {
    let mut session = Session::new("bench-user", 2);
    let answered: HashSet<QuestionId> = (0..catalog_size / 3)
        .map(|i| QuestionId::new(format!("q-{:05}", i * 3)))
        .collect();
    session.questions_answered = u32::try_from(answered.len()).unwrap_or(u32::MAX);
    for domain in Domain::ALL {
        session.answered_domain_counts.insert(domain, 4);
        session.answered_depth_by_domain.insert(domain, 2);
    }
    session.last_question_energy = Some(EnergyDynamic::Heavy);
    SessionState::snapshot(&session, answered, HashMap::new(), None)
}

fn bench_select_next(c: &mut Criterion) {
    let router = QuestionRouter::default();
    let mut group = c.benchmark_group("select_next");

    for size in [100, 1_000, 10_000] {
        let catalog = catalog(size);
        let state = state(size);
        let mut snapshot = FatigueSnapshot::calm(state.session_id, Utc::now());

        group.bench_with_input(BenchmarkId::new("calm", size), &size, |b, _| {
            let mut rng = StdRng::seed_from_u64(7);
            b.iter(|| router.select_next(black_box(&state), &catalog, &snapshot, &mut rng));
        });

        snapshot.level = FatigueLevel::Medium;
        group.bench_with_input(BenchmarkId::new("balancing", size), &size, |b, _| {
            let mut rng = StdRng::seed_from_u64(7);
            b.iter(|| router.select_next(black_box(&state), &catalog, &snapshot, &mut rng));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_select_next);
criterion_main!(benches);
