//! Operator-name to lowering dispatch.
//!
//! Lowering modules contribute [`LoweringDef`] entries to [`LOWERING_DEFS`] at link time. The
//! process-wide [`LoweringRegistry`] is assembled from that slice on first use and never
//! mutated afterwards; [`RegistryBuilder`] assembles private tables with an explicit
//! [`LoweringConfig`].

use std::collections::BTreeMap;
use std::sync::OnceLock;

use thiserror::Error;

use crate::backend::spec::ValueId;
use crate::config::{self, DuplicatePolicy, LoweringConfig};
use crate::ops::graph::GraphBuilder;

use super::activation::ActivationKind;
use super::activation_grad::ActivationGradKind;
use super::context::{LoweringContext, LoweringError};

/// Closed set of lowerings a registry entry can dispatch to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoweringKind {
    Activation(ActivationKind),
    ActivationGrad(ActivationGradKind),
}

impl LoweringKind {
    pub fn op_name(self) -> &'static str {
        match self {
            LoweringKind::Activation(kind) => kind.op_name(),
            LoweringKind::ActivationGrad(kind) => kind.op_name(),
        }
    }

    /// Number of operator inputs: `features` for activations, `(gradients, features)` for
    /// gradients.
    pub fn arity(self) -> usize {
        match self {
            LoweringKind::Activation(_) => 1,
            LoweringKind::ActivationGrad(_) => 2,
        }
    }

    /// Runs the lowering against `ctx` after checking the input count.
    pub fn lower(self, ctx: &mut LoweringContext<'_>) -> anyhow::Result<()> {
        let expected = self.arity();
        if ctx.num_inputs() != expected {
            return Err(LoweringError::Arity {
                op: ctx.op_name(),
                expected,
                actual: ctx.num_inputs(),
            }
            .into());
        }
        match self {
            LoweringKind::Activation(kind) => kind.lower(ctx),
            LoweringKind::ActivationGrad(kind) => kind.lower(ctx),
        }
    }
}

/// Link-time registration record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoweringDef {
    pub name: &'static str,
    pub kind: LoweringKind,
}

impl LoweringDef {
    pub const fn new(name: &'static str, kind: LoweringKind) -> Self {
        Self { name, kind }
    }
}

#[linkme::distributed_slice]
pub static LOWERING_DEFS: [LoweringDef] = [..];

pub fn all_lowering_defs() -> &'static [LoweringDef] {
    &LOWERING_DEFS
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("lowering for {name} registered more than once")]
    DuplicateRegistration { name: &'static str },
    #[error("no lowering registered for operator {0}")]
    UnknownOperator(String),
}

/// Accumulates registrations under a [`DuplicatePolicy`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    policy: DuplicatePolicy,
    entries: BTreeMap<&'static str, LoweringKind>,
}

impl RegistryBuilder {
    pub fn new(config: LoweringConfig) -> Self {
        Self {
            policy: config.duplicate_policy,
            entries: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, def: LoweringDef) -> Result<&mut Self, RegistryError> {
        match self.entries.insert(def.name, def.kind) {
            None => {}
            Some(previous) => match self.policy {
                DuplicatePolicy::Reject => {
                    self.entries.insert(def.name, previous);
                    return Err(RegistryError::DuplicateRegistration { name: def.name });
                }
                DuplicatePolicy::Replace => {
                    log::warn!(
                        "lowering for {} replaced: {:?} -> {:?}",
                        def.name,
                        previous,
                        def.kind
                    );
                }
            },
        }
        Ok(self)
    }

    pub fn register_all<'d, I>(&mut self, defs: I) -> Result<&mut Self, RegistryError>
    where
        I: IntoIterator<Item = &'d LoweringDef>,
    {
        for def in defs {
            self.register(*def)?;
        }
        Ok(self)
    }

    pub fn build(self) -> LoweringRegistry {
        LoweringRegistry {
            entries: self.entries,
        }
    }
}

/// Read-only table mapping operator names to lowerings.
#[derive(Debug, Clone, Default)]
pub struct LoweringRegistry {
    entries: BTreeMap<&'static str, LoweringKind>,
}

impl LoweringRegistry {
    /// Table holding every lowering linked into the binary.
    pub fn builtin(config: LoweringConfig) -> Result<Self, RegistryError> {
        let mut builder = RegistryBuilder::new(config);
        builder.register_all(all_lowering_defs())?;
        Ok(builder.build())
    }

    pub fn get(&self, name: &str) -> Option<LoweringKind> {
        self.entries.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered operator names in sorted order.
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lowers operator `name` applied to `inputs` and returns its single output value.
    pub fn lower(
        &self,
        name: &str,
        builder: &mut GraphBuilder,
        inputs: &[ValueId],
    ) -> anyhow::Result<ValueId> {
        let (&op_name, &kind) = self
            .entries
            .get_key_value(name)
            .ok_or_else(|| RegistryError::UnknownOperator(name.to_string()))?;
        let mut ctx = LoweringContext::new(op_name, builder, inputs);
        kind.lower(&mut ctx)?;
        let output = ctx.into_output()?;
        log::debug!("lowered {op_name}({inputs:?}) -> {output}");
        Ok(output)
    }
}

static GLOBAL_REGISTRY: OnceLock<Result<LoweringRegistry, RegistryError>> = OnceLock::new();

/// Process-wide table built from [`LOWERING_DEFS`] and [`config::process_config`].
pub fn global_registry() -> Result<&'static LoweringRegistry, RegistryError> {
    GLOBAL_REGISTRY
        .get_or_init(|| LoweringRegistry::builtin(config::process_config()))
        .as_ref()
        .map_err(Clone::clone)
}

/// Lowers `name` through the process-wide table.
pub fn lower(name: &str, builder: &mut GraphBuilder, inputs: &[ValueId]) -> anyhow::Result<ValueId> {
    global_registry()?.lower(name, builder, inputs)
}
