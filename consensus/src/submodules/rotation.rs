/// Rotation
///
/// Removes the single oldest active node once it has been active for more
/// than `max_node_age_cycles`. Disabled when the limit is 0. Needs no
/// gossip: every node derives the same choice from the node list.

use super::{check_sorted, Result, SubmoduleContext, SubmoduleError};
use crate::cycle::CycleRecord;

#[derive(Debug, Default)]
pub struct RotationModule;

impl RotationModule {
    pub fn update_record(&self, record: &mut CycleRecord, prev: &CycleRecord, ctx: &SubmoduleContext<'_>) {
        let max_age = ctx.config.max_node_age_cycles;
        if max_age == 0 || ctx.nodes.active_count() < 2 {
            return;
        }

        let oldest = ctx
            .nodes
            .by_age()
            .into_iter()
            .find(|n| prev.counter.saturating_sub(n.activated_at) > max_age);

        if let Some(node) = oldest {
            record.removed = vec![node.id.clone()];
        }
    }

    pub fn validate_record_types(record: &CycleRecord) -> Result<()> {
        if record.removed.len() > 1 {
            return Err(SubmoduleError::Rejected(format!(
                "{} rotations in one cycle",
                record.removed.len()
            )));
        }
        check_sorted("removed", &record.removed)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Env;
    use super::*;
    use crate::config::CycleConfig;
    use crate::network::types::Node;
    use crate::submodules::SubmoduleContext;

    #[test]
    fn test_rotation_disabled_by_default() {
        let env = Env::new(3);
        let me = env.id(0);
        let mut record = env.next_record();
        RotationModule.update_record(&mut record, &env.genesis, &env.ctx(0, &me));
        assert!(record.removed.is_empty());
    }

    #[test]
    fn test_rotation_removes_oldest() {
        let mut env = Env::new(3);
        let old = env.id(2);
        let mut node: Node = env.nodes.get(&old).cloned().unwrap();
        node.activated_at = 0;
        env.nodes.insert(node);
        for i in 0..2 {
            let mut younger = env.nodes.get(&env.id(i)).cloned().unwrap();
            younger.activated_at = 8;
            env.nodes.insert(younger);
        }

        let config = CycleConfig {
            max_node_age_cycles: 5,
            ..CycleConfig::default()
        };
        let me = env.id(0);
        let ctx = SubmoduleContext {
            nodes: &env.nodes,
            counter: 11,
            self_id: &me,
            keypair: &env.keys[0],
            config: &config,
        };
        let mut prev = env.next_record();
        prev.counter = 10;
        let mut record = env.next_record();
        record.counter = 11;

        RotationModule.update_record(&mut record, &prev, &ctx);
        assert_eq!(record.removed, vec![old]);
        assert!(RotationModule::validate_record_types(&record).is_ok());
    }

    #[test]
    fn test_rotation_validation() {
        let env = Env::new(2);
        let mut record = env.next_record();
        record.removed = vec![env.id(0), env.id(1)];
        assert!(RotationModule::validate_record_types(&record).is_err());
    }
}
