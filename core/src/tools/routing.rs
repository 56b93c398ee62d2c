// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Static routing-class and merge-policy tables.
//!
//! Routing is decided per tool NAME, never per call site; handlers look the
//! class up here instead of encoding dispatch decisions themselves.

use serde::{Deserialize, Serialize};

/// How a tool invocation is dispatched across the fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingClass {
    /// Target exactly one worker, selected by workspace
    WorkspaceSpecific,
    /// Target the most-recently-active worker
    ActiveContext,
    /// Fan out to every worker and local, then merge
    Aggregated,
}

/// How the branches of an aggregated tool are merged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Concatenate per-file entries, deduplicate by URI
    OpenFiles,
    /// Concatenate entries, deduplicate by textual identity, cap at 100
    WorkspaceSymbols,
    /// Concatenate non-empty result lines
    FileSearch,
    /// Concatenate entries, tagging each with the originating role
    RoleTagged,
    /// Return the first successful branch
    FirstSuccess,
}

/// The tool table: name, routing class, merge policy for aggregated tools.
pub const KNOWN_TOOLS: &[(&str, RoutingClass, MergePolicy)] = &[
    (
        "open_file",
        RoutingClass::WorkspaceSpecific,
        MergePolicy::FirstSuccess,
    ),
    (
        "get_diagnostics",
        RoutingClass::WorkspaceSpecific,
        MergePolicy::FirstSuccess,
    ),
    (
        "get_definition",
        RoutingClass::WorkspaceSpecific,
        MergePolicy::FirstSuccess,
    ),
    (
        "get_references",
        RoutingClass::WorkspaceSpecific,
        MergePolicy::FirstSuccess,
    ),
    (
        "get_document_symbols",
        RoutingClass::WorkspaceSpecific,
        MergePolicy::FirstSuccess,
    ),
    (
        "get_selection",
        RoutingClass::ActiveContext,
        MergePolicy::FirstSuccess,
    ),
    (
        "get_active_editor",
        RoutingClass::ActiveContext,
        MergePolicy::FirstSuccess,
    ),
    (
        "list_open_files",
        RoutingClass::Aggregated,
        MergePolicy::OpenFiles,
    ),
    (
        "search_workspace_symbols",
        RoutingClass::Aggregated,
        MergePolicy::WorkspaceSymbols,
    ),
    (
        "file_search",
        RoutingClass::Aggregated,
        MergePolicy::FileSearch,
    ),
    (
        "list_workspaces",
        RoutingClass::Aggregated,
        MergePolicy::RoleTagged,
    ),
    (
        "list_instances",
        RoutingClass::Aggregated,
        MergePolicy::RoleTagged,
    ),
];

/// Routing class for a tool name.
///
/// Unknown tools are treated as workspace-specific, the most conservative
/// class: they reach one worker (or local) and never fan out.
pub fn routing_class(tool: &str) -> RoutingClass {
    KNOWN_TOOLS
        .iter()
        .find(|entry| entry.0 == tool)
        .map_or(RoutingClass::WorkspaceSpecific, |entry| entry.1)
}

/// Merge policy for an aggregated tool name.
pub fn merge_policy(tool: &str) -> MergePolicy {
    KNOWN_TOOLS
        .iter()
        .find(|entry| entry.0 == tool)
        .map_or(MergePolicy::FirstSuccess, |entry| entry.2)
}
