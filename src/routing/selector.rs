use crate::routing::{AgentRecord, RoutingPolicy};

/// Pick the next agent from an already-filtered candidate set.
///
/// Candidates are assumed eligible (available and under capacity); callers
/// filter before selecting. Returns a clone of the winning record.
pub fn select_next_agent(
    policy: RoutingPolicy,
    candidates: &[AgentRecord],
) -> Option<AgentRecord> {
    match policy {
        RoutingPolicy::RoundRobin => candidates
            .iter()
            .min_by(|a, b| {
                a.last_routed_at
                    .cmp(&b.last_routed_at)
                    .then_with(|| a.username.cmp(&b.username))
            })
            .cloned(),
        RoutingPolicy::LoadBalancing => candidates
            .iter()
            .min_by(|a, b| {
                a.active_chats
                    .cmp(&b.active_chats)
                    .then_with(|| a.last_routed_at.cmp(&b.last_routed_at))
                    .then_with(|| a.username.cmp(&b.username))
            })
            .cloned(),
        RoutingPolicy::Manual => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(username: &str, last_routed_at: u64, active_chats: u32) -> AgentRecord {
        AgentRecord::new(format!("id-{}", username), username)
            .with_active_chats(active_chats)
            .with_last_routed(last_routed_at)
    }

    #[test]
    fn test_round_robin_picks_least_recently_routed() {
        let candidates = vec![agent("alice", 500, 0), agent("bob", 100, 4)];

        let picked = select_next_agent(RoutingPolicy::RoundRobin, &candidates)
            .expect("no agent selected");
        assert_eq!(picked.username, "bob");
    }

    #[test]
    fn test_round_robin_ties_break_on_username() {
        let candidates = vec![agent("carol", 100, 0), agent("bob", 100, 0)];

        let picked = select_next_agent(RoutingPolicy::RoundRobin, &candidates)
            .expect("no agent selected");
        assert_eq!(picked.username, "bob");
    }

    #[test]
    fn test_load_balancing_picks_fewest_active_chats() {
        let candidates = vec![agent("alice", 100, 3), agent("bob", 900, 1)];

        let picked = select_next_agent(RoutingPolicy::LoadBalancing, &candidates)
            .expect("no agent selected");
        assert_eq!(picked.username, "bob");
    }

    #[test]
    fn test_empty_candidates_select_nobody() {
        assert!(select_next_agent(RoutingPolicy::RoundRobin, &[]).is_none());
        assert!(select_next_agent(RoutingPolicy::LoadBalancing, &[]).is_none());
    }

    #[test]
    fn test_manual_selects_nobody() {
        let candidates = vec![agent("alice", 0, 0)];
        assert!(select_next_agent(RoutingPolicy::Manual, &candidates).is_none());
    }
}
