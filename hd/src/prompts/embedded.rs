//! Embedded default templates
//!
//! Shipped inside the binary so a fresh install works without any template
//! directory. On-disk templates with the same name override these.

/// The context pack rendered into an agent's opening prompt
pub const AGENT_CONTEXT: &str = "\
# Task

{{title}}

{{description}}

## Acceptance criteria
{{#each acceptance_criteria}}
- {{this}}
{{/each}}

## Files you are expected to touch
{{#each affected_files}}
- {{this}}
{{/each}}
{{#if knowledge}}

{{knowledge}}
{{/if}}
{{#if retry_hint}}

## Previous attempt
This is attempt {{attempt_no}}. {{retry_hint}}
{{/if}}

## Rules
- Lock every file before writing it; retry with backoff if the lock is held.
- Stay inside the declared files; request ownership for shared artifacts.
- Run the declared level-1 commands before claiming completion.
- Claim completion only when the checks pass; the gate re-validates everything.
";

/// Rendered when the verification gate rejects a claim, for the retry prompt
pub const RETRY_HINT: &str = "\
The verification gate rejected the last claim.
Failing checks:
{{#each failing_checks}}
- {{this}}
{{/each}}
Fix the causes before claiming again.
";

/// All embedded templates by name
pub fn all() -> Vec<(&'static str, &'static str)> {
    vec![("agent_context", AGENT_CONTEXT), ("retry_hint", RETRY_HINT)]
}
