//! Stack staging: collecting new asset ids per legacy stack as uploads
//! resolve them, with the declared primary asset kept at the front.

use std::collections::BTreeMap;

use crate::checkpoint::Checkpoint;

/// Stages new asset ids into the checkpoint's per-stack lists. Staging can
/// lag asset creation across runs, so every call is idempotent per
/// (stack, new id).
pub struct StackAssembler<'a> {
    /// Legacy stack id → primary legacy asset id.
    primaries: &'a BTreeMap<String, String>,
}

impl<'a> StackAssembler<'a> {
    pub fn new(primaries: &'a BTreeMap<String, String>) -> Self {
        Self { primaries }
    }

    /// Record `new_asset_id` under `stack_id`. The primary asset is inserted
    /// at the front regardless of encounter order; everything else appends.
    /// Unknown stack ids are ignored (the stack belongs to another user).
    pub fn stage(
        &self,
        checkpoint: &mut Checkpoint,
        stack_id: &str,
        legacy_asset_id: &str,
        new_asset_id: &str,
    ) {
        let Some(primary_asset_id) = self.primaries.get(stack_id) else {
            return;
        };

        let staged = checkpoint
            .stack_staging
            .entry(stack_id.to_string())
            .or_default();
        if staged.iter().any(|id| id == new_asset_id) {
            return;
        }

        if primary_asset_id == legacy_asset_id {
            staged.insert(0, new_asset_id.to_string());
        } else {
            staged.push(new_asset_id.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn primaries(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(stack, primary)| (stack.to_string(), primary.to_string()))
            .collect()
    }

    #[test]
    fn primary_lands_at_index_zero_regardless_of_order() {
        let primaries = primaries(&[("s1", "p")]);
        let assembler = StackAssembler::new(&primaries);
        let mut checkpoint = Checkpoint::default();

        assembler.stage(&mut checkpoint, "s1", "a", "new-a");
        assembler.stage(&mut checkpoint, "s1", "b", "new-b");
        assembler.stage(&mut checkpoint, "s1", "p", "new-p");

        assert_eq!(
            checkpoint.stack_staging["s1"],
            vec!["new-p", "new-a", "new-b"]
        );
    }

    #[test]
    fn staging_is_idempotent_across_runs() {
        let primaries = primaries(&[("s1", "p")]);
        let assembler = StackAssembler::new(&primaries);
        let mut checkpoint = Checkpoint::default();

        assembler.stage(&mut checkpoint, "s1", "p", "new-p");
        assembler.stage(&mut checkpoint, "s1", "a", "new-a");
        // A resumed run revisits tracked assets and stages them again.
        assembler.stage(&mut checkpoint, "s1", "p", "new-p");
        assembler.stage(&mut checkpoint, "s1", "a", "new-a");

        assert_eq!(checkpoint.stack_staging["s1"], vec!["new-p", "new-a"]);
    }

    #[test]
    fn foreign_stacks_are_ignored() {
        let primaries = primaries(&[("s1", "p")]);
        let assembler = StackAssembler::new(&primaries);
        let mut checkpoint = Checkpoint::default();

        assembler.stage(&mut checkpoint, "someone-elses", "a", "new-a");
        assert!(checkpoint.stack_staging.is_empty());
    }
}
