use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use namegraph_core::{
    BatchSettings, DetailEdit, Dimension, DimensionKind, EngineSettings, JobId, Rule, RuleSlot,
    StringId, WorkspaceId,
};
use namegraph_catalog::MemoryTaxonomyStore;
use namegraph_engine::{
    BatchOptions, BatchRequest, BatchSelector, BatchSubmission, MemoryAuditStore,
    MemoryStringStore, NamingService, UpdateSpec,
};
use std::collections::HashMap;
use tokio::runtime::Runtime;
use uuid::Uuid;

type Service = NamingService<MemoryStringStore, MemoryAuditStore, MemoryTaxonomyStore>;

struct Env {
    service: Service,
    workspace: WorkspaceId,
    rule: Rule,
}

fn build_env() -> Env {
    let taxonomy = Arc::new(MemoryTaxonomyStore::new());
    let workspace = Uuid::new_v4();
    let environment = Dimension::new(workspace, "environment", DimensionKind::FreeText);
    let region = Dimension::new(workspace, "region", DimensionKind::FreeText);
    let rule = Rule::new(
        workspace,
        "aws",
        vec![
            RuleSlot::new(0, environment.id),
            RuleSlot::new(1, region.id),
        ],
    );
    taxonomy.insert_dimension(environment);
    taxonomy.insert_dimension(region);
    taxonomy.insert_rule(rule.clone());

    let settings = EngineSettings {
        batch: BatchSettings {
            sync_threshold: usize::MAX,
            ..BatchSettings::default()
        },
        ..EngineSettings::default()
    };
    let service = NamingService::new(
        Arc::new(MemoryStringStore::new()),
        Arc::new(MemoryAuditStore::new()),
        taxonomy,
        settings,
    );
    Env {
        service,
        workspace,
        rule,
    }
}

impl Env {
    async fn create(&self, parent: Option<StringId>, environment: &str, region: &str) -> StringId {
        self.service
            .create_string(
                self.workspace,
                self.rule.id,
                parent,
                vec![
                    DetailEdit::set_value(0, environment),
                    DetailEdit::set_value(1, region),
                ],
            )
            .await
            .unwrap()
            .id
    }

    async fn edit_origin(&self, origin: StringId, value: &str) -> Vec<JobId> {
        let submission = self
            .service
            .submit_batch_update(
                BatchRequest {
                    workspace_id: self.workspace,
                    rule_id: self.rule.id,
                    initiator: "bench".into(),
                    selector: BatchSelector::Ids(vec![origin]),
                    updates: UpdateSpec::Uniform(vec![DetailEdit::set_value(0, value)]),
                },
                BatchOptions::default(),
            )
            .await
            .unwrap();
        match submission {
            BatchSubmission::Completed {
                propagation_jobs, ..
            } => propagation_jobs,
            BatchSubmission::Deferred { .. } => unreachable!("threshold disabled"),
        }
    }

    async fn wait_for(&self, job_id: JobId) {
        loop {
            let snapshot = self
                .service
                .get_propagation_job(job_id)
                .await
                .unwrap()
                .unwrap();
            if snapshot.job.status.is_terminal() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

/// A root with `fanout` children per level, `depth` levels deep, every
/// descendant inheriting the root's environment value.
async fn build_tree(env: &Env, fanout: usize, depth: usize) -> StringId {
    let root = env.create(None, "v1", "r-root").await;
    let mut frontier = vec![root];
    for level in 0..depth {
        let mut next = Vec::new();
        for (p, parent) in frontier.iter().enumerate() {
            for i in 0..fanout {
                let region = format!("r-{level}-{p}-{i}");
                next.push(env.create(Some(*parent), "v1", &region).await);
            }
        }
        frontier = next;
    }
    root
}

fn bench_batch_mutation(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("batch_mutation");
    group.measurement_time(Duration::from_secs(8));

    for size in [10, 100, 500].iter() {
        group.bench_with_input(
            BenchmarkId::new("per_string_update", size),
            size,
            |b, &size| {
                b.to_async(&rt).iter(|| async {
                    let env = build_env();
                    let mut targets = Vec::with_capacity(size);
                    for i in 0..size {
                        targets.push(env.create(None, &format!("v{i}"), &format!("r{i}")).await);
                    }
                    let mut updates = HashMap::with_capacity(size);
                    for (i, id) in targets.iter().enumerate() {
                        updates.insert(*id, vec![DetailEdit::set_value(1, format!("z{i}"))]);
                    }
                    let submission = env
                        .service
                        .submit_batch_update(
                            BatchRequest {
                                workspace_id: env.workspace,
                                rule_id: env.rule.id,
                                initiator: "bench".into(),
                                selector: BatchSelector::Ids(targets),
                                updates: UpdateSpec::PerString(updates),
                            },
                            BatchOptions::default(),
                        )
                        .await
                        .unwrap();
                    black_box(submission);
                });
            },
        );
    }

    group.finish();
}

fn bench_cascade_fanout(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("cascade_fanout");
    group.measurement_time(Duration::from_secs(10)).sample_size(20);

    for fanout in [10, 50, 100].iter() {
        group.bench_with_input(
            BenchmarkId::new("children", fanout),
            fanout,
            |b, &fanout| {
                b.to_async(&rt).iter(|| async {
                    let env = build_env();
                    let root = build_tree(&env, fanout, 1).await;
                    let jobs = env.edit_origin(root, "v2").await;
                    for job in jobs {
                        env.wait_for(job).await;
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_cascade_depth(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("cascade_depth");
    group.measurement_time(Duration::from_secs(10)).sample_size(20);

    for depth in [2, 4].iter() {
        group.bench_with_input(BenchmarkId::new("levels", depth), depth, |b, &depth| {
            b.to_async(&rt).iter(|| async {
                let env = build_env();
                let root = build_tree(&env, 2, depth).await;
                let jobs = env.edit_origin(root, "v2").await;
                for job in jobs {
                    env.wait_for(job).await;
                }
            });
        });
    }

    group.finish();
}

fn bench_dry_run_preview(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("conflict_preview");
    group.measurement_time(Duration::from_secs(5));

    group.bench_function("preview_100_roots", |b| {
        b.to_async(&rt).iter(|| async {
            let env = build_env();
            let mut targets = Vec::with_capacity(100);
            for i in 0..100 {
                targets.push(env.create(None, &format!("v{i}"), &format!("r{i}")).await);
            }
            // Every proposal lands on the same value; all but one conflict.
            let conflicts = env
                .service
                .preview_conflicts(BatchRequest {
                    workspace_id: env.workspace,
                    rule_id: env.rule.id,
                    initiator: "bench".into(),
                    selector: BatchSelector::Ids(targets),
                    updates: UpdateSpec::Uniform(vec![DetailEdit::set_value(0, "shared")]),
                })
                .await
                .unwrap();
            black_box(conflicts);
        });
    });

    group.finish();
}

criterion_group!(
    propagation_benches,
    bench_batch_mutation,
    bench_cascade_fanout,
    bench_cascade_depth,
    bench_dry_run_preview
);

criterion_main!(propagation_benches);
