// crates/elspeth-token/src/manager.rs
// ============================================================================
// Module: ELSPETH Token Manager
// Description: Fork/expand/coalesce token lifecycle with deep-copy isolation.
// ============================================================================

//! ## Overview
//! A fork or expand must hand every child its own independent row
//! payload: a mutation a downstream transform makes to one branch's
//! data must never become visible on a sibling branch, or the audit
//! trail silently corrupts (a recorded input hash for one token would
//! stop matching the data it was actually computed from).
//!
//! `serde_json::Value` is an owned tree with no shared interior
//! mutability, so `Value::clone` is already a structural deep copy: two
//! clones never alias the same heap-allocated `Vec`/`Map` buffer.
//! `TokenManager` relies on this property instead of hand-rolling a
//! recursive copy, the way the original Python implementation had to
//! after a shared-reference bug (P2-2026-01-21) slipped through a
//! shallow `dict.copy()`.

use time::OffsetDateTime;

use elspeth_core::identifiers::RowId;
use elspeth_core::identifiers::TokenId;
use elspeth_core::model::Token;

use crate::error::TokenError;

/// Builds and isolates tokens across fork, expand, and coalesce
/// transitions (§4.4).
#[derive(Debug, Default)]
pub struct TokenManager;

impl TokenManager {
    /// Creates a new token manager.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Creates the root token for `row_id`.
    #[must_use]
    pub fn create_token(&self, token_id: TokenId, row_id: RowId, now: OffsetDateTime) -> Token {
        Token {
            token_id,
            row_id,
            fork_group_id: None,
            join_group_id: None,
            expand_group_id: None,
            branch_name: None,
            step_in_pipeline: None,
            created_at: now,
        }
    }

    /// Forks `parent` into one child token per entry in `branches`,
    /// each carrying an independently cloned copy of `parent_data`
    /// (or `override_data`, if provided).
    ///
    /// Returns `(child_token, child_data)` pairs sharing a common
    /// `fork_group_id`, plus the generated fork group ID.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::EmptyFanout`] if `branches` is empty, or
    /// [`TokenError::DuplicateBranch`] if two branches share a name.
    pub fn fork_token(
        &self,
        parent: &Token,
        parent_data: &serde_json::Value,
        branches: &[String],
        fork_group_id: String,
        mut next_token_id: impl FnMut(usize) -> TokenId,
        override_data: Option<&serde_json::Value>,
        now: OffsetDateTime,
    ) -> Result<Vec<(Token, serde_json::Value)>, TokenError> {
        if branches.is_empty() {
            return Err(TokenError::EmptyFanout { operation: "fork", unit: "branch" });
        }
        let mut seen = std::collections::HashSet::new();
        for branch in branches {
            if !seen.insert(branch) {
                return Err(TokenError::DuplicateBranch(branch.clone()));
            }
        }

        let source = override_data.unwrap_or(parent_data);
        let children = branches
            .iter()
            .enumerate()
            .map(|(index, branch)| {
                let child = Token {
                    token_id: next_token_id(index),
                    row_id: parent.row_id.clone(),
                    fork_group_id: Some(fork_group_id.clone()),
                    join_group_id: None,
                    expand_group_id: None,
                    branch_name: Some(branch.clone()),
                    step_in_pipeline: parent.step_in_pipeline,
                    created_at: now,
                };
                (child, source.clone())
            })
            .collect();
        Ok(children)
    }

    /// Expands `parent` into one child token per entry in `items`,
    /// each carrying the corresponding item as its row data. Children
    /// share a common `expand_group_id`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::EmptyFanout`] if `items` is empty.
    pub fn expand_token(
        &self,
        parent: &Token,
        items: Vec<serde_json::Value>,
        expand_group_id: String,
        mut next_token_id: impl FnMut(usize) -> TokenId,
        now: OffsetDateTime,
    ) -> Result<Vec<(Token, serde_json::Value)>, TokenError> {
        if items.is_empty() {
            return Err(TokenError::EmptyFanout { operation: "expand", unit: "item" });
        }
        let children = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                let child = Token {
                    token_id: next_token_id(index),
                    row_id: parent.row_id.clone(),
                    fork_group_id: None,
                    join_group_id: None,
                    expand_group_id: Some(expand_group_id.clone()),
                    branch_name: None,
                    step_in_pipeline: parent.step_in_pipeline,
                    created_at: now,
                };
                (child, item)
            })
            .collect();
        Ok(children)
    }

    /// Merges `members` (the consumed branch tokens of a join) into a
    /// single coalesced token carrying `merged_data`, sharing
    /// `join_group_id` back to the originating coalesce node.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::EmptyCoalesce`] if `members` is empty.
    pub fn coalesce_tokens(
        &self,
        members: &[Token],
        merged_data: serde_json::Value,
        join_group_id: String,
        coalesced_token_id: TokenId,
        now: OffsetDateTime,
    ) -> Result<(Token, serde_json::Value), TokenError> {
        let first = members.first().ok_or(TokenError::EmptyCoalesce)?;
        let token = Token {
            token_id: coalesced_token_id,
            row_id: first.row_id.clone(),
            fork_group_id: None,
            join_group_id: Some(join_group_id),
            expand_group_id: None,
            branch_name: None,
            step_in_pipeline: first.step_in_pipeline,
            created_at: now,
        };
        Ok((token, merged_data))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Test-only panic-based assertions are permitted.")]
mod tests {
    use super::*;
    use serde_json::json;

    fn parent_token() -> Token {
        Token {
            token_id: TokenId::new("parent-1"),
            row_id: RowId::new("row-1"),
            fork_group_id: None,
            join_group_id: None,
            expand_group_id: None,
            branch_name: None,
            step_in_pipeline: Some(2),
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn fork_assigns_distinct_ids_and_shared_group() {
        let manager = TokenManager::new();
        let parent = parent_token();
        let data = json!({ "nested": { "values": [1, 2, 3] } });
        let branches = vec!["flagged".to_string(), "clean".to_string()];

        let children = manager
            .fork_token(
                &parent,
                &data,
                &branches,
                "fork-group-1".to_string(),
                |index| TokenId::new(format!("child-{index}")),
                None,
                OffsetDateTime::UNIX_EPOCH,
            )
            .unwrap();

        assert_eq!(children.len(), 2);
        assert_ne!(children[0].0.token_id, children[1].0.token_id);
        assert_eq!(children[0].0.fork_group_id, children[1].0.fork_group_id);
        assert_eq!(children[0].0.row_id, parent.row_id);
        for (_, child_data) in &children {
            assert_eq!(child_data, &data);
        }
    }

    #[test]
    fn fork_children_do_not_alias_parent_data() {
        let manager = TokenManager::new();
        let parent = parent_token();
        let mut data = json!({ "list": [1, 2, 3] });
        let branches = vec!["a".to_string(), "b".to_string()];

        let children = manager
            .fork_token(
                &parent,
                &data,
                &branches,
                "fork-group".to_string(),
                |index| TokenId::new(format!("child-{index}")),
                None,
                OffsetDateTime::UNIX_EPOCH,
            )
            .unwrap();

        // Mutating the parent's source value after forking must not
        // affect already-cloned children: clone happened at fork time.
        data["list"].as_array_mut().unwrap().push(json!(4));
        assert_eq!(children[0].1["list"], json!([1, 2, 3]));
        assert_eq!(children[1].1["list"], json!([1, 2, 3]));
    }

    #[test]
    fn fork_rejects_empty_branch_list() {
        let manager = TokenManager::new();
        let parent = parent_token();
        let error = manager
            .fork_token(
                &parent,
                &json!({}),
                &[],
                "fork-group".to_string(),
                |index| TokenId::new(format!("child-{index}")),
                None,
                OffsetDateTime::UNIX_EPOCH,
            )
            .unwrap_err();
        assert_eq!(error, TokenError::EmptyFanout { operation: "fork", unit: "branch" });
    }

    #[test]
    fn fork_rejects_duplicate_branch_names() {
        let manager = TokenManager::new();
        let parent = parent_token();
        let error = manager
            .fork_token(
                &parent,
                &json!({}),
                &["dup".to_string(), "dup".to_string()],
                "fork-group".to_string(),
                |index| TokenId::new(format!("child-{index}")),
                None,
                OffsetDateTime::UNIX_EPOCH,
            )
            .unwrap_err();
        assert_eq!(error, TokenError::DuplicateBranch("dup".to_string()));
    }

    #[test]
    fn expand_creates_one_child_per_item() {
        let manager = TokenManager::new();
        let parent = parent_token();
        let items = vec![json!({ "n": 1 }), json!({ "n": 2 }), json!({ "n": 3 })];

        let children = manager
            .expand_token(
                &parent,
                items.clone(),
                "expand-group".to_string(),
                |index| TokenId::new(format!("item-{index}")),
                OffsetDateTime::UNIX_EPOCH,
            )
            .unwrap();

        assert_eq!(children.len(), 3);
        for ((_, child_data), expected) in children.iter().zip(items.iter()) {
            assert_eq!(child_data, expected);
        }
        assert!(children.iter().all(|(token, _)| token.expand_group_id.is_some()));
    }

    #[test]
    fn coalesce_merges_members_into_one_token() {
        let manager = TokenManager::new();
        let members = vec![
            Token { token_id: TokenId::new("branch-a"), ..parent_token() },
            Token { token_id: TokenId::new("branch-b"), ..parent_token() },
        ];
        let merged = json!({ "combined": true });

        let (token, data) = manager
            .coalesce_tokens(
                &members,
                merged.clone(),
                "join-group".to_string(),
                TokenId::new("joined"),
                OffsetDateTime::UNIX_EPOCH,
            )
            .unwrap();

        assert_eq!(token.token_id, TokenId::new("joined"));
        assert_eq!(token.join_group_id, Some("join-group".to_string()));
        assert_eq!(data, merged);
    }

    #[test]
    fn coalesce_rejects_empty_member_list() {
        let manager = TokenManager::new();
        let error = manager
            .coalesce_tokens(
                &[],
                json!({}),
                "join-group".to_string(),
                TokenId::new("joined"),
                OffsetDateTime::UNIX_EPOCH,
            )
            .unwrap_err();
        assert_eq!(error, TokenError::EmptyCoalesce);
    }
}
