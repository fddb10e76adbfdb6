//! Pipeline distribution planner: splits a logical plan into the remote
//! sub-plan (run identically on every shard) and the local sub-plan (run
//! once over the merged stream), rewriting reducers through a fixed
//! transformation table.
//!
//! Split rules:
//! 1. Filter stages are always remote-only — each shard filters only its
//!    own documents.
//! 2. A SORTBY before any grouping stage is pushed remote (shards pre-sort,
//!    the coordinator k-way merges); a SORTBY after grouping stays local.
//! 3. GROUPBY is split per the reducer table below; remote intermediates
//!    get private aliases so they cannot collide with user names.
//! 4. LIMIT on an ungrouped plan is applied at both levels: `offset+count`
//!    as the per-shard upper bound, the exact window locally. LIMIT after a
//!    grouping stage stays local-only — a per-shard bound on grouped rows
//!    could drop a group's partial and corrupt the combined aggregate.

use shrike_common::config::QueryConfig;
use shrike_common::error::{CoordError, CoordResult};

use crate::plan::{
    AggregationPlan, DistributedPlan, GroupReduce, LocalCombine, LocalPlan, Reducer, RemotePlan,
    Stage, Window, PRIVATE_ALIAS_PREFIX,
};

/// Split `plan` into its remote and local halves.
pub fn distribute(plan: &AggregationPlan, cfg: &QueryConfig) -> CoordResult<DistributedPlan> {
    let mut remote_stages: Vec<Stage> = Vec::new();
    let mut combines: Vec<LocalCombine> = Vec::new();
    let mut group_keys: Vec<String> = Vec::new();
    let mut merge_sort = None;
    let mut local_sort = None;
    let mut window = Window {
        offset: 0,
        count: cfg.default_limit,
    };
    let mut grouped = false;
    let mut remote_limit_idx: Option<usize> = None;

    for stage in &plan.stages {
        match stage {
            Stage::Filter(expr) => {
                remote_stages.push(Stage::Filter(expr.clone()));
            }
            Stage::SortBy(spec) => {
                if grouped {
                    local_sort = Some(spec.clone());
                } else {
                    remote_stages.push(Stage::SortBy(spec.clone()));
                    merge_sort = Some(spec.clone());
                }
            }
            Stage::GroupBy { keys, reduces } => {
                if grouped {
                    return Err(CoordError::Planner(
                        "cannot distribute a plan with more than one grouping stage".into(),
                    ));
                }
                grouped = true;
                group_keys = keys.clone();
                // Any earlier LIMIT bounded documents, not groups. Without
                // a trailing LIMIT, all combined groups are returned.
                window = Window {
                    offset: 0,
                    count: usize::MAX,
                };

                let mut remote_reduces = Vec::new();
                for (i, gr) in reduces.iter().enumerate() {
                    let (remotes, combine) = distribute_reducer(i, gr, cfg.sample_size)?;
                    remote_reduces.extend(remotes);
                    combines.push(combine);
                }
                remote_stages.push(Stage::GroupBy {
                    keys: keys.clone(),
                    reduces: remote_reduces,
                });
            }
            Stage::Limit(w) => {
                window = *w;
                if !grouped {
                    let bound = Stage::Limit(Window {
                        offset: 0,
                        count: w.remote_bound(),
                    });
                    // A later LIMIT replaces an earlier remote bound.
                    match remote_limit_idx {
                        Some(idx) => remote_stages[idx] = bound,
                        None => {
                            remote_stages.push(bound);
                            remote_limit_idx = Some(remote_stages.len() - 1);
                        }
                    }
                }
            }
        }
    }

    // Ungrouped plans with no explicit LIMIT still bound per-shard transfer
    // by the default window.
    if !grouped && remote_limit_idx.is_none() {
        remote_stages.push(Stage::Limit(Window {
            offset: 0,
            count: window.remote_bound(),
        }));
    }

    Ok(DistributedPlan {
        remote: RemotePlan {
            index: plan.index.clone(),
            stages: remote_stages,
        },
        local: LocalPlan {
            group_keys,
            combines,
            sort: local_sort,
            window,
        },
        merge_sort: if grouped { None } else { merge_sort },
    })
}

/// The fixed per-reducer transformation table: client reducer → (remote
/// reducer forms with private aliases, local combinator).
fn distribute_reducer(
    idx: usize,
    gr: &GroupReduce,
    sample_size: usize,
) -> CoordResult<(Vec<GroupReduce>, LocalCombine)> {
    if gr.reducer.is_internal() {
        return Err(CoordError::Planner(format!(
            "reducer {} is internal and cannot appear in a client plan",
            gr.reducer.name()
        )));
    }

    let p = |suffix: &str| format!("{}{}_{}", PRIVATE_ALIAS_PREFIX, idx, suffix);
    let out = gr.alias.clone();

    let split = match &gr.reducer {
        Reducer::Count => (
            vec![GroupReduce {
                reducer: Reducer::Count,
                alias: p("count"),
            }],
            LocalCombine::SumInto {
                src: p("count"),
                out,
            },
        ),
        Reducer::Sum(field) => (
            vec![GroupReduce {
                reducer: Reducer::Sum(field.clone()),
                alias: p("sum"),
            }],
            LocalCombine::SumInto { src: p("sum"), out },
        ),
        Reducer::Min(field) => (
            vec![GroupReduce {
                reducer: Reducer::Min(field.clone()),
                alias: p("min"),
            }],
            LocalCombine::MinInto { src: p("min"), out },
        ),
        Reducer::Max(field) => (
            vec![GroupReduce {
                reducer: Reducer::Max(field.clone()),
                alias: p("max"),
            }],
            LocalCombine::MaxInto { src: p("max"), out },
        ),
        Reducer::ToList(field) => (
            vec![GroupReduce {
                reducer: Reducer::ToList(field.clone()),
                alias: p("list"),
            }],
            LocalCombine::ConcatInto { src: p("list"), out },
        ),
        Reducer::Avg(field) => (
            vec![
                GroupReduce {
                    reducer: Reducer::Sum(field.clone()),
                    alias: p("sum"),
                },
                GroupReduce {
                    reducer: Reducer::Count,
                    alias: p("count"),
                },
            ],
            LocalCombine::AvgOf {
                sum: p("sum"),
                count: p("count"),
                out,
            },
        ),
        Reducer::StdDev(field) => (
            vec![
                GroupReduce {
                    reducer: Reducer::Sum(field.clone()),
                    alias: p("sum"),
                },
                GroupReduce {
                    reducer: Reducer::Count,
                    alias: p("count"),
                },
                GroupReduce {
                    reducer: Reducer::SumOfSquares(field.clone()),
                    alias: p("sumsq"),
                },
            ],
            LocalCombine::StdDevOf {
                sum: p("sum"),
                count: p("count"),
                sum_sq: p("sumsq"),
                out,
            },
        ),
        Reducer::Quantile(field, q) => {
            if !(0.0..=1.0).contains(q) {
                return Err(CoordError::Planner(format!(
                    "QUANTILE({}) is outside [0, 1]",
                    q
                )));
            }
            (
                vec![GroupReduce {
                    reducer: Reducer::RandomSample(field.clone(), sample_size),
                    alias: p("sample"),
                }],
                LocalCombine::QuantileOf {
                    sample: p("sample"),
                    q: *q,
                    out,
                },
            )
        }
        Reducer::RandomSample(_, _) | Reducer::SumOfSquares(_) => unreachable!(),
    };
    Ok(split)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::SortSpec;

    fn cfg() -> QueryConfig {
        QueryConfig::default()
    }

    fn gb(reduces: Vec<GroupReduce>) -> Stage {
        Stage::GroupBy {
            keys: vec!["category".into()],
            reduces,
        }
    }

    #[test]
    fn test_filter_and_sort_go_remote() {
        let plan = AggregationPlan::new(
            "products",
            vec![
                Stage::Filter("@price:[0 100]".into()),
                Stage::SortBy(SortSpec {
                    key: "price".into(),
                    ascending: true,
                }),
                Stage::Limit(Window { offset: 5, count: 20 }),
            ],
        );
        let dist = distribute(&plan, &cfg()).expect("distribute");

        assert_eq!(dist.remote.stages.len(), 3);
        assert!(matches!(dist.remote.stages[0], Stage::Filter(_)));
        assert!(matches!(dist.remote.stages[1], Stage::SortBy(_)));
        // Remote bound is offset+count, local window is exact.
        assert_eq!(
            dist.remote.stages[2],
            Stage::Limit(Window { offset: 0, count: 25 })
        );
        assert_eq!(dist.local.window, Window { offset: 5, count: 20 });
        assert_eq!(dist.merge_sort.as_ref().map(|s| s.key.as_str()), Some("price"));
        assert!(!dist.local.is_grouped());
    }

    #[test]
    fn test_default_window_bounds_remote() {
        let plan = AggregationPlan::new("idx", vec![Stage::Filter("*".into())]);
        let dist = distribute(&plan, &cfg()).expect("distribute");
        assert_eq!(
            dist.remote.stages.last(),
            Some(&Stage::Limit(Window { offset: 0, count: 10 }))
        );
    }

    #[test]
    fn test_count_becomes_remote_count_local_sum() {
        let plan = AggregationPlan::new(
            "idx",
            vec![gb(vec![GroupReduce {
                reducer: Reducer::Count,
                alias: "n".into(),
            }])],
        );
        let dist = distribute(&plan, &cfg()).expect("distribute");

        let Stage::GroupBy { reduces, .. } = &dist.remote.stages[0] else {
            panic!("expected remote GroupBy");
        };
        assert_eq!(reduces.len(), 1);
        assert_eq!(reduces[0].reducer, Reducer::Count);
        assert!(reduces[0].alias.starts_with(PRIVATE_ALIAS_PREFIX));
        assert!(matches!(
            &dist.local.combines[0],
            LocalCombine::SumInto { out, .. } if out == "n"
        ));
    }

    #[test]
    fn test_avg_decomposes_into_sum_and_count() {
        let plan = AggregationPlan::new(
            "idx",
            vec![gb(vec![GroupReduce {
                reducer: Reducer::Avg("price".into()),
                alias: "avg_price".into(),
            }])],
        );
        let dist = distribute(&plan, &cfg()).expect("distribute");

        let Stage::GroupBy { reduces, .. } = &dist.remote.stages[0] else {
            panic!("expected remote GroupBy");
        };
        assert_eq!(reduces.len(), 2);
        assert_eq!(reduces[0].reducer, Reducer::Sum("price".into()));
        assert_eq!(reduces[1].reducer, Reducer::Count);
        assert!(matches!(
            &dist.local.combines[0],
            LocalCombine::AvgOf { out, .. } if out == "avg_price"
        ));
    }

    #[test]
    fn test_stddev_emits_three_partials() {
        let plan = AggregationPlan::new(
            "idx",
            vec![gb(vec![GroupReduce {
                reducer: Reducer::StdDev("latency".into()),
                alias: "sd".into(),
            }])],
        );
        let dist = distribute(&plan, &cfg()).expect("distribute");
        let Stage::GroupBy { reduces, .. } = &dist.remote.stages[0] else {
            panic!("expected remote GroupBy");
        };
        assert_eq!(reduces.len(), 3);
        assert_eq!(reduces[2].reducer, Reducer::SumOfSquares("latency".into()));
    }

    #[test]
    fn test_quantile_becomes_sample() {
        let plan = AggregationPlan::new(
            "idx",
            vec![gb(vec![GroupReduce {
                reducer: Reducer::Quantile("latency".into(), 0.99),
                alias: "p99".into(),
            }])],
        );
        let dist = distribute(&plan, &cfg()).expect("distribute");
        let Stage::GroupBy { reduces, .. } = &dist.remote.stages[0] else {
            panic!("expected remote GroupBy");
        };
        assert_eq!(
            reduces[0].reducer,
            Reducer::RandomSample("latency".into(), 500)
        );
    }

    #[test]
    fn test_sort_after_group_stays_local() {
        let plan = AggregationPlan::new(
            "idx",
            vec![
                gb(vec![GroupReduce {
                    reducer: Reducer::Count,
                    alias: "n".into(),
                }]),
                Stage::SortBy(SortSpec {
                    key: "n".into(),
                    ascending: false,
                }),
                Stage::Limit(Window { offset: 0, count: 5 }),
            ],
        );
        let dist = distribute(&plan, &cfg()).expect("distribute");

        // No remote SortBy, no remote Limit: grouped plans transfer all groups.
        assert!(dist
            .remote
            .stages
            .iter()
            .all(|s| !matches!(s, Stage::SortBy(_) | Stage::Limit(_))));
        assert_eq!(dist.local.sort.as_ref().map(|s| s.key.as_str()), Some("n"));
        assert_eq!(dist.local.window, Window { offset: 0, count: 5 });
        assert!(dist.merge_sort.is_none());
    }

    #[test]
    fn test_internal_reducer_rejected() {
        let plan = AggregationPlan::new(
            "idx",
            vec![gb(vec![GroupReduce {
                reducer: Reducer::SumOfSquares("x".into()),
                alias: "x2".into(),
            }])],
        );
        let err = distribute(&plan, &cfg()).unwrap_err();
        assert!(matches!(err, CoordError::Planner(_)));
    }

    #[test]
    fn test_second_grouping_rejected() {
        let plan = AggregationPlan::new(
            "idx",
            vec![
                gb(vec![GroupReduce {
                    reducer: Reducer::Count,
                    alias: "n".into(),
                }]),
                gb(vec![GroupReduce {
                    reducer: Reducer::Count,
                    alias: "m".into(),
                }]),
            ],
        );
        assert!(matches!(
            distribute(&plan, &cfg()).unwrap_err(),
            CoordError::Planner(_)
        ));
    }

    #[test]
    fn test_quantile_out_of_range_rejected() {
        let plan = AggregationPlan::new(
            "idx",
            vec![gb(vec![GroupReduce {
                reducer: Reducer::Quantile("x".into(), 1.5),
                alias: "q".into(),
            }])],
        );
        assert!(matches!(
            distribute(&plan, &cfg()).unwrap_err(),
            CoordError::Planner(_)
        ));
    }

    #[test]
    fn test_stage_order_preserved() {
        let plan = AggregationPlan::new(
            "idx",
            vec![
                Stage::Filter("a".into()),
                Stage::Filter("b".into()),
                Stage::SortBy(SortSpec {
                    key: "ts".into(),
                    ascending: true,
                }),
            ],
        );
        let dist = distribute(&plan, &cfg()).expect("distribute");
        assert!(matches!(&dist.remote.stages[0], Stage::Filter(e) if e == "a"));
        assert!(matches!(&dist.remote.stages[1], Stage::Filter(e) if e == "b"));
        assert!(matches!(&dist.remote.stages[2], Stage::SortBy(_)));
    }
}
