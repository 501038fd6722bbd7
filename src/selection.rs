use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Url;

use crate::client::{ReplicaRole, TransitionRow};
use crate::snapshot::InstanceState;
use crate::ControlError;

pub fn round_robin_successor(current_primary: usize, replicas: usize) -> usize {
    (current_primary + 1) % replicas
}

/// Max over reachable standbys of the min `last_update` across their
/// databases. Falls back to the first standby when none has a timestamp.
pub fn pick_next_primary(states: &[InstanceState]) -> Option<usize> {
    let mut first_standby = None;
    let mut best: Option<(usize, DateTime<Utc>)> = None;
    for (index, entry) in states.iter().enumerate() {
        let Some(db) = entry.db() else {
            continue;
        };
        if db.role != ReplicaRole::Standby {
            continue;
        }
        first_standby.get_or_insert(index);

        let oldest = db.status.iter().filter_map(|row| row.last_update).min();
        if let Some(oldest) = oldest {
            if best.map_or(true, |(_, updated)| updated < oldest) {
                best = Some((index, oldest));
            }
        }
    }
    best.map(|(index, _)| index).or(first_standby)
}

/// Instance caught up on the most databases; ties go to the lowest index.
pub fn most_caught_up_standby(rows: &[TransitionRow], states: &[InstanceState]) -> Result<usize> {
    let mut caught_up: BTreeMap<String, usize> = BTreeMap::new();
    for row in rows {
        let url = Url::parse(&row.remote_url)
            .with_context(|| format!("error parsing remote url {} of database {}", row.remote_url, row.database))?;
        let host = url.host_str().unwrap_or_default().to_string();
        let count = caught_up.entry(host).or_insert(0);
        if row.caught_up {
            *count += 1;
        }
    }

    let best_count = caught_up.values().copied().max().unwrap_or(0);
    if best_count == 0 {
        return Err(ControlError::NoCaughtUpStandby.into());
    }

    let winners: Vec<&String> = caught_up
        .iter()
        .filter(|(_, count)| **count == best_count)
        .map(|(host, _)| host)
        .collect();

    let mut chosen: Option<usize> = None;
    for host in &winners {
        if let Some(index) = instance_for_host(host, states) {
            chosen = Some(chosen.map_or(index, |current| current.min(index)));
        }
    }
    chosen.ok_or_else(|| {
        let hosts: Vec<&str> = winners.iter().map(|host| host.as_str()).collect();
        ControlError::CaughtUpHostNotFound(hosts.join(", ")).into()
    })
}

fn instance_for_host(host: &str, states: &[InstanceState]) -> Option<usize> {
    if host.is_empty() {
        return None;
    }
    let dotted = format!("{host}.");
    states.iter().position(|entry| {
        let hostname = entry.instance.hostname();
        hostname == host || hostname.starts_with(&dotted)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StatusRow;
    use crate::snapshot::DbState;
    use crate::test_support::fake::FakeInstance;
    use chrono::Duration;

    fn state(role: ReplicaRole, updates: &[Option<DateTime<Utc>>]) -> InstanceState {
        let status = updates
            .iter()
            .enumerate()
            .map(|(i, last_update)| StatusRow {
                database: format!("db{i}"),
                last_update: *last_update,
                ..StatusRow::default()
            })
            .collect();
        InstanceState::reachable(
            FakeInstance::detached("replica"),
            DbState {
                role,
                epoch: 10,
                status,
                ..DbState::default()
            },
        )
    }

    fn hosted(hostname: &str, role: ReplicaRole) -> InstanceState {
        InstanceState::reachable(
            FakeInstance::with_hostname(hostname, hostname),
            DbState {
                role,
                ..DbState::default()
            },
        )
    }

    fn row(caught_up: bool, database: &str, host: &str) -> TransitionRow {
        TransitionRow {
            caught_up,
            database: database.into(),
            remote: "standby".into(),
            remote_url: format!("http://{host}:50051/{database}"),
        }
    }

    #[test]
    fn round_robin_wraps() {
        assert_eq!(round_robin_successor(0, 2), 1);
        assert_eq!(round_robin_successor(1, 2), 0);
        assert_eq!(round_robin_successor(2, 3), 0);
    }

    #[test]
    fn empty_snapshot_has_no_candidate() {
        assert_eq!(pick_next_primary(&[]), None);
    }

    #[test]
    fn single_standby_without_status() {
        let states = vec![state(ReplicaRole::Primary, &[]), state(ReplicaRole::Standby, &[])];
        assert_eq!(pick_next_primary(&states), Some(1));
    }

    #[test]
    fn no_statuses_falls_back_to_first_standby() {
        let states = vec![
            state(ReplicaRole::Standby, &[]),
            state(ReplicaRole::Standby, &[]),
            state(ReplicaRole::Primary, &[]),
        ];
        assert_eq!(pick_next_primary(&states), Some(0));
    }

    #[test]
    fn newest_last_update_wins_regardless_of_order() {
        let earlier = Utc::now() - Duration::minutes(1);
        let later = earlier + Duration::minutes(1);

        let second = vec![
            state(ReplicaRole::Standby, &[Some(earlier)]),
            state(ReplicaRole::Standby, &[Some(later)]),
            state(ReplicaRole::Primary, &[]),
        ];
        assert_eq!(pick_next_primary(&second), Some(1));

        let first = vec![
            state(ReplicaRole::Standby, &[Some(later)]),
            state(ReplicaRole::Standby, &[Some(earlier)]),
            state(ReplicaRole::Primary, &[]),
        ];
        assert_eq!(pick_next_primary(&first), Some(0));
    }

    #[test]
    fn compares_each_standbys_stalest_database() {
        let now = Utc::now();
        // a is fresher on db0 but much staler on db1.
        let a = state(
            ReplicaRole::Standby,
            &[Some(now), Some(now - Duration::minutes(10))],
        );
        let b = state(
            ReplicaRole::Standby,
            &[Some(now - Duration::minutes(2)), Some(now - Duration::minutes(3))],
        );
        assert_eq!(pick_next_primary(&[a.clone(), b.clone()]), Some(1));
        assert_eq!(pick_next_primary(&[b, a]), Some(0));
    }

    #[test]
    fn timestamped_standby_beats_earlier_untimestamped_one() {
        let states = vec![
            state(ReplicaRole::Standby, &[None]),
            state(ReplicaRole::Standby, &[Some(Utc::now())]),
        ];
        assert_eq!(pick_next_primary(&states), Some(1));
    }

    #[test]
    fn skips_unreachable_and_broken_instances() {
        let states = vec![
            InstanceState::unreachable(FakeInstance::detached("gone"), anyhow::anyhow!("down")),
            state(ReplicaRole::DetectedBrokenConfig, &[Some(Utc::now())]),
            state(ReplicaRole::Primary, &[]),
        ];
        assert_eq!(pick_next_primary(&states), None);
    }

    #[test]
    fn picks_host_caught_up_on_most_databases() {
        let states = vec![
            hosted("doltdb-0.doltdb.default", ReplicaRole::Primary),
            hosted("doltdb-1.doltdb.default", ReplicaRole::Standby),
            hosted("doltdb-2.doltdb.default", ReplicaRole::Standby),
        ];
        let rows = vec![
            row(true, "a", "doltdb-1.doltdb"),
            row(false, "b", "doltdb-1.doltdb"),
            row(true, "a", "doltdb-2.doltdb"),
            row(true, "b", "doltdb-2.doltdb"),
        ];
        assert_eq!(most_caught_up_standby(&rows, &states).expect("winner"), 2);
    }

    #[test]
    fn ties_go_to_lowest_instance_index() {
        let states = vec![
            hosted("doltdb-0.doltdb", ReplicaRole::Primary),
            hosted("doltdb-1.doltdb", ReplicaRole::Standby),
            hosted("doltdb-2.doltdb", ReplicaRole::Standby),
        ];
        let rows = vec![row(true, "a", "doltdb-2.doltdb"), row(true, "a", "doltdb-1.doltdb")];
        assert_eq!(most_caught_up_standby(&rows, &states).expect("winner"), 1);
    }

    #[test]
    fn host_prefix_respects_label_boundaries() {
        let states = vec![
            hosted("doltdb-10.doltdb", ReplicaRole::Standby),
            hosted("doltdb-1.doltdb", ReplicaRole::Standby),
        ];
        let rows = vec![row(true, "a", "doltdb-1")];
        assert_eq!(most_caught_up_standby(&rows, &states).expect("winner"), 1);
    }

    #[test]
    fn unknown_caught_up_host_is_an_error() {
        let states = vec![hosted("doltdb-0.doltdb", ReplicaRole::Primary)];
        let rows = vec![row(true, "a", "elsewhere.example")];
        let error = most_caught_up_standby(&rows, &states).expect_err("no match");
        assert!(matches!(
            error.downcast_ref::<ControlError>(),
            Some(ControlError::CaughtUpHostNotFound(host)) if host == "elsewhere.example"
        ));
    }

    #[test]
    fn nothing_caught_up_is_an_error() {
        let states = vec![hosted("doltdb-1.doltdb", ReplicaRole::Standby)];
        let rows = vec![row(false, "a", "doltdb-1.doltdb")];
        let error = most_caught_up_standby(&rows, &states).expect_err("nothing caught up");
        assert!(matches!(
            error.downcast_ref::<ControlError>(),
            Some(ControlError::NoCaughtUpStandby)
        ));
    }
}
