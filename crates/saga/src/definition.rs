//! Saga definitions: the transition table an orchestrator drives.

use std::fmt::Debug;

use domain::{MessageType, SagaSchema};

/// Command type of a definition's schema.
pub type CommandOf<D> = <<D as SagaDefinition>::Schema as SagaSchema>::CommandType;
/// Reply type of a definition's schema.
pub type ReplyOf<D> = <<D as SagaDefinition>::Schema as SagaSchema>::ReplyType;
/// Entity payload of a definition's schema.
pub type EntityOf<D> = <<D as SagaDefinition>::Schema as SagaSchema>::Entity;

/// What the orchestrator does with one reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition<K, C> {
    /// The awaited step committed; issue the next command.
    Advance(C),
    /// The awaited step committed; run the next step as a linked child saga
    /// of `kind` whose first command is `command`.
    SubSaga { kind: K, command: C },
    /// The awaited step committed and it was the last one.
    Complete,
    /// The awaited step failed; compensate starting with this command.
    Compensate(C),
    /// A compensating command was acknowledged.
    Compensated,
    /// A compensating command failed.
    CompensationFailed,
    /// Unrecognised reply; no state change.
    Ignore,
}

/// How a child saga ended, as relayed to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
    CompensationFailed,
}

/// The forward/compensation table for one family of saga kinds sharing a
/// message schema.
///
/// Every lookup is an exhaustive `match` over closed enums, so no reply can
/// produce a command outside the vocabulary.
pub trait SagaDefinition: Send + Sync + 'static {
    type Schema: SagaSchema;
    type Kind: Copy + Eq + Debug + Send + Sync + 'static;

    /// Kind created by `Orchestrator::start`.
    const ROOT: Self::Kind;
    /// Every kind this definition drives.
    const KINDS: &'static [Self::Kind];

    fn kind_name(kind: Self::Kind) -> &'static str;

    fn parse_kind(name: &str) -> Option<Self::Kind> {
        Self::KINDS
            .iter()
            .copied()
            .find(|k| Self::kind_name(*k) == name)
    }

    fn initial_command(kind: Self::Kind) -> CommandOf<Self>;

    fn transition(
        kind: Self::Kind,
        reply: ReplyOf<Self>,
        entity: &EntityOf<Self>,
    ) -> Transition<Self::Kind, CommandOf<Self>>;

    /// Reply types a participant (or a relaying child) may send for `step`.
    /// Anything else is ignored without touching the saga.
    fn answers(step: CommandOf<Self>) -> &'static [ReplyOf<Self>];

    /// Command undoing a committed forward step.
    fn rollback(step: CommandOf<Self>) -> Option<CommandOf<Self>>;

    /// Command preventing an in-flight forward step from taking effect.
    fn cancel(step: CommandOf<Self>) -> Option<CommandOf<Self>>;

    /// Reply a child of `kind` sends its parent when it ends.
    fn relay(kind: Self::Kind, outcome: Outcome) -> Option<ReplyOf<Self>> {
        let _ = (kind, outcome);
        None
    }
}

/// Builds the compensation plan: `first`, then the rollback of every
/// committed step innermost-first, each command at most once.
pub fn compensation_plan<D: SagaDefinition>(
    first: Option<CommandOf<D>>,
    committed: &[CommandOf<D>],
) -> Vec<CommandOf<D>> {
    let mut plan: Vec<CommandOf<D>> = first.into_iter().collect();
    for step in committed.iter().rev() {
        if let Some(rollback) = D::rollback(*step)
            && !plan.contains(&rollback)
        {
            plan.push(rollback);
        }
    }
    plan
}

/// Parses stored step names back into commands.
pub(crate) fn parse_steps<D: SagaDefinition>(steps: &[String]) -> Vec<CommandOf<D>> {
    steps
        .iter()
        .map(|s| <CommandOf<D> as MessageType>::parse(s))
        .filter(|c| !c.is_unknown())
        .collect()
}
