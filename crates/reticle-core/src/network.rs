//! Match network construction
//!
//! Rules are attached one at a time to a [`NetworkBuilder`], which reuses
//! equivalent nodes between them:
//!
//! - object-type nodes by fact kind, and alpha nodes by (parent, constraint),
//!   across the whole network; they hold no memory
//! - left input adapters by object source
//! - beta nodes only among the children of the same left parent, so a shared
//!   beta node always sits under a single adapter and in a single partition
//!
//! [`NetworkBuilder::build`] freezes the arena into a [`Network`]: node ids are
//! compacted in creation order, which keeps every left parent at a lower id
//! than its children, partition slots are mapped to dense partition ids and
//! segment and path layouts are computed.

use crate::accumulate::Accumulator;
use crate::action::Action;
use crate::config::EngineConfig;
use crate::constraint::{AlphaConstraint, BetaConstraint, JoinIndex, same_alpha, same_beta};
use crate::declaration::Declarations;
use crate::error::{ReticleError, ReticleResult, ResultExt};
use crate::exchange::{AsyncComputation, SendFilter};
use crate::rule::{
    ConditionElement, Consequence, MESSAGE_VALUE_FIELD, Pattern, RESULT_FIELD, RuleDefinition,
};
use crate::segment::SegmentLayouts;
use crate::types::{INITIAL_FACT_KIND, NodeId, PartitionId, RuleId};
use ahash::AHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Constraints of a beta node plus the equality index derived from them
#[derive(Clone)]
pub struct BetaSpec {
    pub constraints: Vec<Arc<dyn BetaConstraint>>,
    pub index: Option<JoinIndex>,
}

impl BetaSpec {
    pub fn new(constraints: Vec<Arc<dyn BetaConstraint>>) -> Self {
        let index = constraints.iter().find_map(|c| c.index());
        Self { constraints, index }
    }

    pub fn is_indexed(&self) -> bool {
        self.index.is_some()
    }

    fn same_as(&self, other: &BetaSpec) -> bool {
        self.constraints.len() == other.constraints.len()
            && self.constraints.iter().zip(&other.constraints).all(|(a, b)| same_beta(a, b))
    }
}

fn same_accumulator(a: &Arc<dyn Accumulator>, b: &Arc<dyn Accumulator>) -> bool {
    if std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ()) {
        return true;
    }
    matches!((a.share_key(), b.share_key()), (Some(x), Some(y)) if x == y)
}

fn same_filter(
    a: &Option<Arc<dyn AlphaConstraint>>,
    b: &Option<Arc<dyn AlphaConstraint>>,
) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => same_alpha(a, b),
        _ => false,
    }
}

#[derive(Clone)]
pub enum NodeKind {
    ObjectType {
        kind: String,
    },
    Alpha {
        constraint: Arc<dyn AlphaConstraint>,
    },
    LeftInputAdapter,
    Join(BetaSpec),
    Not(BetaSpec),
    Exists(BetaSpec),
    Accumulate {
        beta: BetaSpec,
        accumulator: Arc<dyn Accumulator>,
        filter: Option<Arc<dyn AlphaConstraint>>,
    },
    AsyncSend {
        message_id: String,
        computation: Arc<dyn AsyncComputation>,
        filter: SendFilter,
    },
    AsyncReceive {
        message_id: String,
        beta: BetaSpec,
    },
    Terminal {
        rule: RuleId,
    },
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::ObjectType { .. } => "object_type",
            NodeKind::Alpha { .. } => "alpha",
            NodeKind::LeftInputAdapter => "left_input_adapter",
            NodeKind::Join(_) => "join",
            NodeKind::Not(_) => "not",
            NodeKind::Exists(_) => "exists",
            NodeKind::Accumulate { .. } => "accumulate",
            NodeKind::AsyncSend { .. } => "async_send",
            NodeKind::AsyncReceive { .. } => "async_receive",
            NodeKind::Terminal { .. } => "terminal",
        }
    }

    /// Nodes whose output can go empty and therefore own a variable link bit.
    /// Async messages never rest in a receive node's memory, so a receive
    /// node links with its left input.
    pub fn has_link_bit(&self) -> bool {
        matches!(self, NodeKind::LeftInputAdapter | NodeKind::Join(_) | NodeKind::Exists(_))
    }

    /// Constraints evaluated between the left match and a right fact
    pub fn beta(&self) -> Option<&BetaSpec> {
        match self {
            NodeKind::Join(beta) | NodeKind::Not(beta) | NodeKind::Exists(beta) => Some(beta),
            NodeKind::Accumulate { beta, .. } | NodeKind::AsyncReceive { beta, .. } => Some(beta),
            _ => None,
        }
    }

    pub fn is_beta(&self) -> bool {
        self.beta().is_some()
    }

    fn shares_with(&self, other: &NodeKind) -> bool {
        match (self, other) {
            (NodeKind::Join(a), NodeKind::Join(b))
            | (NodeKind::Not(a), NodeKind::Not(b))
            | (NodeKind::Exists(a), NodeKind::Exists(b)) => a.same_as(b),
            (
                NodeKind::Accumulate { beta: a, accumulator: acc_a, filter: filter_a },
                NodeKind::Accumulate { beta: b, accumulator: acc_b, filter: filter_b },
            ) => a.same_as(b) && same_accumulator(acc_a, acc_b) && same_filter(filter_a, filter_b),
            (
                NodeKind::AsyncReceive { message_id: id_a, beta: a },
                NodeKind::AsyncReceive { message_id: id_b, beta: b },
            ) => id_a == id_b && a.same_as(b),
            _ => false,
        }
    }
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::ObjectType { kind } => write!(f, "ObjectType({kind})"),
            NodeKind::AsyncSend { message_id, .. } => write!(f, "AsyncSend({message_id})"),
            NodeKind::AsyncReceive { message_id, .. } => write!(f, "AsyncReceive({message_id})"),
            NodeKind::Terminal { rule } => write!(f, "Terminal({rule})"),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub left_parent: Option<NodeId>,
    /// Right input for beta nodes, upstream filter for alpha nodes and adapters
    pub object_parent: Option<NodeId>,
    pub left_sinks: Vec<NodeId>,
    pub object_sinks: Vec<NodeId>,
    /// Owning partition; set for left-chain nodes only
    pub partition: Option<PartitionId>,
    /// Partitions fed through this object-side node
    pub reach: BTreeSet<PartitionId>,
    pub rules: BTreeSet<RuleId>,
    /// Declarations of the tuples arriving on the left input
    pub declarations: Arc<Declarations>,
    /// Number of tuple levels arriving on the left input
    pub level: usize,
    removed: bool,
}

/// A rule as attached to a built network
#[derive(Clone)]
pub struct RuleInfo {
    pub id: RuleId,
    pub name: String,
    pub salience: i32,
    /// Terminal or async-send node
    pub end: NodeId,
    pub partition: PartitionId,
    pub action: Option<Arc<dyn Action>>,
    pub declarations: Arc<Declarations>,
}

impl fmt::Debug for RuleInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleInfo")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("salience", &self.salience)
            .field("end", &self.end)
            .field("partition", &self.partition)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ReceiverInfo {
    pub node: NodeId,
    pub message_id: String,
    pub partition: PartitionId,
}

struct RuleEntry {
    name: String,
    salience: i32,
    end: NodeId,
    action: Option<Arc<dyn Action>>,
    declarations: Arc<Declarations>,
    nodes: BTreeSet<NodeId>,
}

/// Validated conditions and the declaration table in force before each one
struct Plan {
    conditions: Vec<ConditionElement>,
    prefixes: Vec<Arc<Declarations>>,
}

/// Incrementally attaches rules and assigns their partitions
pub struct NetworkBuilder {
    config: EngineConfig,
    nodes: Vec<Node>,
    rules: Vec<Option<RuleEntry>>,
    object_types: AHashMap<String, NodeId>,
    slots: AHashMap<NodeId, usize>,
    next_slot: usize,
}

impl NetworkBuilder {
    #[instrument(skip(config))]
    pub fn new(config: &EngineConfig) -> Self {
        debug!(partitions = config.partitions, "Creating network builder");
        Self {
            config: config.clone(),
            nodes: Vec::new(),
            rules: Vec::new(),
            object_types: AHashMap::new(),
            slots: AHashMap::new(),
            next_slot: 0,
        }
    }

    /// Attach a rule. Nothing is modified when validation fails.
    #[instrument(skip(self, rule), fields(rule = %rule.name))]
    pub fn add_rule(&mut self, rule: RuleDefinition) -> ReticleResult<RuleId> {
        let plan = self.validate(&rule)?;
        let rule_id = self.rules.len();
        let mut used = BTreeSet::new();
        let mut left: Option<NodeId> = None;

        for (level, condition) in plan.conditions.iter().enumerate() {
            let declarations = Arc::clone(&plan.prefixes[level]);
            let next = match (left, condition) {
                (None, ConditionElement::Pattern(pattern)) => {
                    let source = self.attach_object_source(pattern, &mut used);
                    self.attach_adapter(source, &mut used)
                }
                (None, other) => {
                    return Err(ReticleError::internal_component(
                        "network",
                        format!("Rule cannot start with a {} condition", other.name()),
                    ));
                }
                (Some(parent), ConditionElement::Pattern(pattern)) => {
                    let right = self.attach_object_source(pattern, &mut used);
                    let kind = NodeKind::Join(BetaSpec::new(pattern.beta.clone()));
                    self.attach_beta(parent, Some(right), kind, declarations, level, &mut used)
                }
                (Some(parent), ConditionElement::Not(pattern)) => {
                    let right = self.attach_object_source(pattern, &mut used);
                    let kind = NodeKind::Not(BetaSpec::new(pattern.beta.clone()));
                    self.attach_beta(parent, Some(right), kind, declarations, level, &mut used)
                }
                (Some(parent), ConditionElement::Exists(pattern)) => {
                    let right = self.attach_object_source(pattern, &mut used);
                    let kind = NodeKind::Exists(BetaSpec::new(pattern.beta.clone()));
                    self.attach_beta(parent, Some(right), kind, declarations, level, &mut used)
                }
                (Some(parent), ConditionElement::Accumulate(spec)) => {
                    let right = self.attach_object_source(&spec.source, &mut used);
                    let kind = NodeKind::Accumulate {
                        beta: BetaSpec::new(spec.source.beta.clone()),
                        accumulator: Arc::clone(&spec.accumulator),
                        filter: spec.filter.clone(),
                    };
                    self.attach_beta(parent, Some(right), kind, declarations, level, &mut used)
                }
                (Some(parent), ConditionElement::Receive(spec)) => {
                    let kind = NodeKind::AsyncReceive {
                        message_id: spec.message_id.clone(),
                        beta: BetaSpec::new(spec.constraints.clone()),
                    };
                    self.attach_beta(parent, None, kind, declarations, level, &mut used)
                }
            };
            left = Some(next);
        }

        let parent = left.ok_or_else(|| ReticleError::build(&rule.name, "Rule has no conditions"))?;
        let full = Arc::clone(&plan.prefixes[plan.conditions.len()]);
        let (kind, action) = match &rule.consequence {
            Some(Consequence::Action(action)) => {
                (NodeKind::Terminal { rule: rule_id }, Some(Arc::clone(action)))
            }
            Some(Consequence::Send(spec)) => (
                NodeKind::AsyncSend {
                    message_id: spec.message_id.clone(),
                    computation: Arc::clone(&spec.computation),
                    filter: spec.filter.clone(),
                },
                None,
            ),
            None => return Err(ReticleError::build(&rule.name, "Rule has no consequence")),
        };
        let end = self.push_node(kind, Some(parent), None, Arc::clone(&full), plan.conditions.len());
        used.insert(end);

        for node in &used {
            self.nodes[*node].rules.insert(rule_id);
        }
        info!(rule_id, nodes = used.len(), "Rule attached to network");
        self.rules.push(Some(RuleEntry {
            name: rule.name,
            salience: rule.salience,
            end,
            action,
            declarations: full,
            nodes: used,
        }));
        Ok(rule_id)
    }

    /// Detach a rule and every node no other rule uses
    #[instrument(skip(self))]
    pub fn remove_rule(&mut self, name: &str) -> ReticleResult<()> {
        let rule_id = self
            .rule_position(name)
            .ok_or_else(|| ReticleError::build(name, "Rule is not attached"))?;
        let Some(entry) = self.rules[rule_id].take() else {
            return Err(ReticleError::build(name, "Rule is not attached"));
        };

        let mut detached = 0;
        for node in entry.nodes.iter().rev().copied() {
            self.nodes[node].rules.remove(&rule_id);
            if self.nodes[node].rules.is_empty() {
                self.detach(node);
                detached += 1;
            }
        }
        info!(rule_id, detached, "Rule removed from network");
        Ok(())
    }

    /// Move a rule to another partition slot. Every rule entering through
    /// the same left input adapter moves with it.
    #[instrument(skip(self))]
    pub fn assign_partition(&mut self, name: &str, slot: usize) -> ReticleResult<()> {
        if slot >= self.config.partitions {
            return Err(ReticleError::configuration(
                "partitions",
                &format!("slot below {}", self.config.partitions),
                &slot.to_string(),
                "Partition slot out of range",
            ));
        }
        let entry = self
            .rule_position(name)
            .and_then(|id| self.rules[id].as_ref())
            .ok_or_else(|| ReticleError::build(name, "Rule is not attached"))?;

        let mut cursor = Some(entry.end);
        while let Some(node) = cursor {
            if matches!(self.nodes[node].kind, NodeKind::LeftInputAdapter) {
                let moved = self.nodes[node].rules.len();
                self.slots.insert(node, slot);
                debug!(adapter = node, slot, moved, "Partition slot reassigned");
                return Ok(());
            }
            cursor = self.nodes[node].left_parent;
        }
        Err(ReticleError::internal_component("network", format!("Rule '{name}' has no left input adapter")))
    }

    pub fn rule_count(&self) -> usize {
        self.rules.iter().flatten().count()
    }

    /// Freeze the arena into an immutable network
    #[instrument(skip(self))]
    pub fn build(self) -> ReticleResult<Network> {
        self.config.validate()?;

        let mut remap: Vec<Option<NodeId>> = vec![None; self.nodes.len()];
        for (new_id, node) in self.nodes.iter().filter(|n| !n.removed).enumerate() {
            remap[node.id] = Some(new_id);
        }
        let mut rule_remap: Vec<Option<RuleId>> = vec![None; self.rules.len()];
        for (new_id, (old_id, _)) in
            self.rules.iter().enumerate().filter(|(_, r)| r.is_some()).enumerate()
        {
            rule_remap[old_id] = Some(new_id);
        }

        let mut slots: AHashMap<NodeId, usize> = AHashMap::new();
        for (old_id, slot) in &self.slots {
            if let Some(new_id) = remap[*old_id] {
                slots.insert(new_id, *slot);
            }
        }

        let mut nodes: Vec<Node> = self
            .nodes
            .into_iter()
            .filter(|n| !n.removed)
            .map(|mut node| {
                node.id = remap[node.id].unwrap_or(node.id);
                node.left_parent = node.left_parent.and_then(|p| remap[p]);
                node.object_parent = node.object_parent.and_then(|p| remap[p]);
                node.left_sinks = node.left_sinks.iter().filter_map(|s| remap[*s]).collect();
                node.object_sinks = node.object_sinks.iter().filter_map(|s| remap[*s]).collect();
                node.rules = node.rules.iter().filter_map(|r| rule_remap[*r]).collect();
                if let NodeKind::Terminal { rule } = &mut node.kind {
                    *rule = rule_remap[*rule].unwrap_or(*rule);
                }
                node
            })
            .collect();

        let used_slots: BTreeSet<usize> = slots.values().copied().collect();
        let partitioned = self.config.multithread_evaluation && used_slots.len() >= 2;
        let partitions = if partitioned { used_slots.len() } else { 1 };
        let dense: BTreeMap<usize, PartitionId> =
            used_slots.iter().enumerate().map(|(dense, slot)| (*slot, dense)).collect();

        for id in 0..nodes.len() {
            let partition = match nodes[id].kind {
                NodeKind::LeftInputAdapter => Some(if partitioned {
                    slots.get(&id).and_then(|slot| dense.get(slot)).copied().unwrap_or_default()
                } else {
                    0
                }),
                _ => nodes[id].left_parent.and_then(|parent| nodes[parent].partition),
            };
            nodes[id].partition = partition;
        }

        for id in 0..nodes.len() {
            let (Some(partition), Some(mut upstream)) = (nodes[id].partition, nodes[id].object_parent)
            else {
                continue;
            };
            loop {
                nodes[upstream].reach.insert(partition);
                match nodes[upstream].object_parent {
                    Some(parent) => upstream = parent,
                    None => break,
                }
            }
        }

        let mut object_types = AHashMap::new();
        let mut kind_partitions = AHashMap::new();
        let mut receivers = Vec::new();
        for node in &nodes {
            match &node.kind {
                NodeKind::ObjectType { kind } => {
                    object_types.insert(kind.clone(), node.id);
                    kind_partitions.insert(kind.clone(), node.reach.iter().copied().collect());
                }
                NodeKind::AsyncReceive { message_id, .. } => receivers.push(ReceiverInfo {
                    node: node.id,
                    message_id: message_id.clone(),
                    partition: node.partition.unwrap_or_default(),
                }),
                _ => {}
            }
        }

        let rules: Vec<RuleInfo> = self
            .rules
            .into_iter()
            .flatten()
            .enumerate()
            .map(|(id, entry)| {
                let end = remap[entry.end].unwrap_or(entry.end);
                RuleInfo {
                    id,
                    name: entry.name,
                    salience: entry.salience,
                    end,
                    partition: nodes[end].partition.unwrap_or_default(),
                    action: entry.action,
                    declarations: entry.declarations,
                }
            })
            .collect();

        let rule_ends: Vec<NodeId> = rules.iter().map(|r| r.end).collect();
        let layouts = SegmentLayouts::compute(&nodes, &rule_ends);

        info!(
            rules = rules.len(),
            nodes = nodes.len(),
            segments = layouts.segments.len(),
            partitions,
            partitioned,
            "Network built"
        );
        Ok(Network {
            nodes,
            rules,
            object_types,
            kind_partitions,
            receivers,
            layouts,
            partitions,
            partitioned,
            config: self.config,
        })
    }

    fn rule_position(&self, name: &str) -> Option<RuleId> {
        self.rules.iter().position(|r| r.as_ref().is_some_and(|r| r.name == name))
    }

    fn validate(&self, rule: &RuleDefinition) -> ReticleResult<Plan> {
        if rule.name.is_empty() {
            return Err(ReticleError::build(&rule.name, "Rule name is empty"));
        }
        if self.rule_position(&rule.name).is_some() {
            return Err(ReticleError::build(&rule.name, "A rule with this name is already attached"));
        }
        if rule.consequence.is_none() {
            return Err(ReticleError::build(&rule.name, "Rule has no consequence"));
        }

        let mut conditions = rule.conditions.clone();
        if !matches!(conditions.first(), Some(ConditionElement::Pattern(_))) {
            conditions.insert(0, ConditionElement::Pattern(Pattern::new(INITIAL_FACT_KIND)));
        }

        let (declarations, prefixes) = plan_declarations(&conditions).with_rule_context(&rule.name)?;
        if let Some(Consequence::Send(spec)) = &rule.consequence {
            check_joins(&declarations, &spec.filter.constraints).with_rule_context(&rule.name)?;
        }
        Ok(Plan { conditions, prefixes })
    }

    fn push_node(
        &mut self,
        kind: NodeKind,
        left_parent: Option<NodeId>,
        object_parent: Option<NodeId>,
        declarations: Arc<Declarations>,
        level: usize,
    ) -> NodeId {
        let id = self.nodes.len();
        if let Some(parent) = left_parent {
            self.nodes[parent].left_sinks.push(id);
        }
        if let Some(parent) = object_parent {
            self.nodes[parent].object_sinks.push(id);
        }
        debug!(node = id, kind = ?kind, "Node created");
        self.nodes.push(Node {
            id,
            kind,
            left_parent,
            object_parent,
            left_sinks: Vec::new(),
            object_sinks: Vec::new(),
            partition: None,
            reach: BTreeSet::new(),
            rules: BTreeSet::new(),
            declarations,
            level,
            removed: false,
        });
        id
    }

    fn attach_object_source(&mut self, pattern: &Pattern, used: &mut BTreeSet<NodeId>) -> NodeId {
        let mut current = match self.object_types.get(&pattern.kind) {
            Some(id) => *id,
            None => {
                let kind = NodeKind::ObjectType { kind: pattern.kind.clone() };
                let id = self.push_node(kind, None, None, Arc::default(), 0);
                self.object_types.insert(pattern.kind.clone(), id);
                id
            }
        };
        used.insert(current);

        for constraint in &pattern.alpha {
            let existing = self.nodes[current].object_sinks.iter().copied().find(|sink| {
                matches!(&self.nodes[*sink].kind, NodeKind::Alpha { constraint: c } if same_alpha(c, constraint))
            });
            current = match existing {
                Some(id) => {
                    debug!(node = id, "Sharing alpha node");
                    id
                }
                None => {
                    let kind = NodeKind::Alpha { constraint: Arc::clone(constraint) };
                    self.push_node(kind, None, Some(current), Arc::default(), 0)
                }
            };
            used.insert(current);
        }
        current
    }

    fn attach_adapter(&mut self, source: NodeId, used: &mut BTreeSet<NodeId>) -> NodeId {
        let existing = self.nodes[source]
            .object_sinks
            .iter()
            .copied()
            .find(|sink| matches!(self.nodes[*sink].kind, NodeKind::LeftInputAdapter));
        let id = match existing {
            Some(id) => id,
            None => {
                let id = self.push_node(NodeKind::LeftInputAdapter, None, Some(source), Arc::default(), 0);
                let slot = self.next_slot % self.config.partitions.max(1);
                self.next_slot += 1;
                self.slots.insert(id, slot);
                debug!(node = id, slot, "Left input adapter assigned to partition slot");
                id
            }
        };
        used.insert(id);
        id
    }

    fn attach_beta(
        &mut self,
        parent: NodeId,
        right: Option<NodeId>,
        kind: NodeKind,
        declarations: Arc<Declarations>,
        level: usize,
        used: &mut BTreeSet<NodeId>,
    ) -> NodeId {
        let shared = self.nodes[parent].left_sinks.iter().copied().find(|sink| {
            let node = &self.nodes[*sink];
            node.object_parent == right
                && *node.declarations == *declarations
                && node.kind.shares_with(&kind)
        });
        let id = match shared {
            Some(id) => {
                debug!(node = id, kind = kind.name(), "Sharing beta node");
                id
            }
            None => self.push_node(kind, Some(parent), right, declarations, level),
        };
        used.insert(id);
        id
    }

    fn detach(&mut self, id: NodeId) {
        self.nodes[id].removed = true;
        if let Some(parent) = self.nodes[id].left_parent {
            self.nodes[parent].left_sinks.retain(|sink| *sink != id);
        }
        if let Some(parent) = self.nodes[id].object_parent {
            self.nodes[parent].object_sinks.retain(|sink| *sink != id);
        }
        if let NodeKind::ObjectType { kind } = &self.nodes[id].kind {
            self.object_types.remove(kind);
        }
        self.slots.remove(&id);
        debug!(node = id, "Node detached");
    }
}

/// Declaration table after each condition level, checking that every
/// constraint only reads what earlier levels declare
fn plan_declarations(
    conditions: &[ConditionElement],
) -> ReticleResult<(Declarations, Vec<Arc<Declarations>>)> {
    let mut declarations = Declarations::new();
    let mut prefixes = vec![Arc::new(declarations.clone())];
    for (level, condition) in conditions.iter().enumerate() {
        match condition {
            ConditionElement::Pattern(pattern) => {
                if level == 0 && !pattern.beta.is_empty() {
                    return Err(ReticleError::rule_build(
                        "The first pattern cannot carry join constraints",
                    ));
                }
                check_joins(&declarations, &pattern.beta)?;
                for (name, field) in &pattern.bindings {
                    declarations.declare(name, level, field.as_deref()).map_err(ReticleError::rule_build)?;
                }
            }
            ConditionElement::Not(pattern) | ConditionElement::Exists(pattern) => {
                if !pattern.bindings.is_empty() {
                    return Err(ReticleError::rule_build(format!(
                        "Bindings inside a {} condition are not visible",
                        condition.name()
                    )));
                }
                check_joins(&declarations, &pattern.beta)?;
            }
            ConditionElement::Accumulate(spec) => {
                if !spec.source.bindings.is_empty() {
                    return Err(ReticleError::rule_build(
                        "Bindings inside an accumulate source are not visible",
                    ));
                }
                check_joins(&declarations, &spec.source.beta)?;
                if let Some(name) = &spec.binding {
                    declarations.declare(name, level, Some(RESULT_FIELD)).map_err(ReticleError::rule_build)?;
                }
            }
            ConditionElement::Receive(spec) => {
                check_joins(&declarations, &spec.constraints)?;
                if let Some(name) = &spec.binding {
                    declarations
                        .declare(name, level, Some(MESSAGE_VALUE_FIELD))
                        .map_err(ReticleError::rule_build)?;
                }
            }
        }
        prefixes.push(Arc::new(declarations.clone()));
    }
    Ok((declarations, prefixes))
}

fn check_joins(declarations: &Declarations, constraints: &[Arc<dyn BetaConstraint>]) -> ReticleResult<()> {
    for constraint in constraints {
        for name in constraint.required_declarations() {
            if declarations.get(&name).is_none() {
                return Err(ReticleError::rule_build(format!(
                    "Constraint reads undeclared variable '{name}'"
                )));
            }
        }
        if let Some(index) = constraint.index() {
            match declarations.get(&index.left_declaration) {
                Some(declaration) if declaration.field.is_some() => {}
                _ => {
                    return Err(ReticleError::rule_build(format!(
                        "Join index needs a field declaration named '{}'",
                        index.left_declaration
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Immutable, shareable match network
pub struct Network {
    nodes: Vec<Node>,
    rules: Vec<RuleInfo>,
    object_types: AHashMap<String, NodeId>,
    kind_partitions: AHashMap<String, Vec<PartitionId>>,
    receivers: Vec<ReceiverInfo>,
    layouts: SegmentLayouts,
    partitions: usize,
    partitioned: bool,
    config: EngineConfig,
}

impl Network {
    /// Build a network from rule definitions in declaration order
    pub fn from_rules(
        config: &EngineConfig,
        rules: impl IntoIterator<Item = RuleDefinition>,
    ) -> ReticleResult<Self> {
        let mut builder = NetworkBuilder::new(config);
        for rule in rules {
            builder.add_rule(rule)?;
        }
        builder.build()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn rules(&self) -> &[RuleInfo] {
        &self.rules
    }

    pub fn rule(&self, name: &str) -> Option<&RuleInfo> {
        self.rules.iter().find(|r| r.name == name)
    }

    pub fn object_type(&self, kind: &str) -> Option<NodeId> {
        self.object_types.get(kind).copied()
    }

    /// Partitions a fact of `kind` must be routed to
    pub fn partitions_for(&self, kind: &str) -> &[PartitionId] {
        self.kind_partitions.get(kind).map_or(&[], Vec::as_slice)
    }

    pub fn receivers(&self) -> &[ReceiverInfo] {
        &self.receivers
    }

    pub fn layouts(&self) -> &SegmentLayouts {
        &self.layouts
    }

    /// Partitions holding at least one rule; 1 when not partitioned
    pub fn used_partitions(&self) -> usize {
        self.partitions
    }

    pub fn is_partitioned(&self) -> bool {
        self.partitioned
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Name of the lowest rule using `node`, for error context
    pub(crate) fn rule_name_of(&self, node: NodeId) -> Option<&str> {
        let rule = *self.nodes.get(node)?.rules.first()?;
        self.rules.get(rule).map(|r| r.name.as_str())
    }
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("nodes", &self.nodes.len())
            .field("rules", &self.rules)
            .field("partitions", &self.partitions)
            .field("partitioned", &self.partitioned)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulate::Aggregate;
    use crate::rule::{AccumulateSpec, ReceiveSpec, SendSpec};
    use crate::types::{FactValue, Operator};

    fn noop(rule: RuleDefinition) -> RuleDefinition {
        rule.then(|_, _| Ok(()))
    }

    fn config(partitions: usize) -> EngineConfig {
        EngineConfig { partitions, async_workers: 1, idle_poll_ms: 1, ..EngineConfig::default() }
    }

    fn a_then_b(name: &str) -> RuleDefinition {
        noop(
            RuleDefinition::new(name)
                .pattern(Pattern::new("A").bind_field("v", "value"))
                .pattern(Pattern::new("B").join_on("value", Operator::GreaterThan, "v")),
        )
    }

    #[test]
    fn test_join_chain_layout() {
        let network = Network::from_rules(&config(1), [a_then_b("r")]).unwrap();
        let kinds: Vec<&str> = network.nodes().iter().map(|n| n.kind.name()).collect();
        assert_eq!(
            kinds,
            vec!["object_type", "left_input_adapter", "object_type", "join", "terminal"]
        );
        let join = &network.nodes()[3];
        assert_eq!(join.left_parent, Some(1));
        assert_eq!(join.object_parent, Some(2));
        assert_eq!(join.level, 1);
        assert_eq!(network.rules()[0].end, 4);
        assert_eq!(network.layouts().segments.len(), 1);
        assert!(!network.is_partitioned());
    }

    #[test]
    fn test_identical_prefixes_share_beta_nodes() {
        let network = Network::from_rules(&config(4), [a_then_b("r1"), a_then_b("r2")]).unwrap();
        let joins = network.nodes().iter().filter(|n| matches!(n.kind, NodeKind::Join(_))).count();
        let terminals =
            network.nodes().iter().filter(|n| matches!(n.kind, NodeKind::Terminal { .. })).count();
        // JoinCondition carries a share key, so both rules reuse one join
        assert_eq!(joins, 1);
        assert_eq!(terminals, 2);
        assert_eq!(network.used_partitions(), 1);
        // a shared join splits the chain into three segments
        assert_eq!(network.layouts().segments.len(), 3);
    }

    #[test]
    fn test_alpha_nodes_are_shared_across_partitions() {
        let filter: Arc<dyn AlphaConstraint> =
            Arc::new(crate::constraint::FieldConstraint::new("value", Operator::GreaterThan, 0));
        let r1 = noop(
            RuleDefinition::new("r1")
                .pattern(Pattern::new("A").filter_shared(Arc::clone(&filter)))
                .pattern(Pattern::new("C")),
        );
        let r2 = noop(
            RuleDefinition::new("r2")
                .pattern(Pattern::new("B"))
                .pattern(Pattern::new("A").filter_shared(filter)),
        );
        let network = Network::from_rules(&config(2), [r1, r2]).unwrap();
        let alphas: Vec<&Node> =
            network.nodes().iter().filter(|n| matches!(n.kind, NodeKind::Alpha { .. })).collect();
        assert_eq!(alphas.len(), 1);
        assert_eq!(alphas[0].reach, BTreeSet::from([0, 1]));
        assert!(network.is_partitioned());
        assert_eq!(network.partitions_for("A"), &[0, 1]);
        assert_eq!(network.rule("r1").unwrap().partition, 0);
        assert_eq!(network.rule("r2").unwrap().partition, 1);
    }

    #[test]
    fn test_non_pattern_first_condition_gets_initial_fact() {
        let rule = noop(RuleDefinition::new("quiet").not(Pattern::new("Alarm")));
        let network = Network::from_rules(&config(1), [rule]).unwrap();
        assert!(network.object_type(INITIAL_FACT_KIND).is_some());
        assert!(network.nodes().iter().any(|n| matches!(n.kind, NodeKind::Not(_))));
    }

    #[test]
    fn test_build_errors_leave_builder_untouched() {
        let mut builder = NetworkBuilder::new(&config(1));
        let missing = RuleDefinition::new("missing")
            .pattern(Pattern::new("A"))
            .pattern(Pattern::new("B").join_on("value", Operator::Equal, "nope"));
        let err = builder.add_rule(noop(missing)).unwrap_err();
        assert!(matches!(err, ReticleError::Build { .. }));

        let no_action = RuleDefinition::new("silent").pattern(Pattern::new("A"));
        assert!(builder.add_rule(no_action).is_err());

        let hidden = noop(
            RuleDefinition::new("hidden").pattern(Pattern::new("A")).not(Pattern::new("B").bind("b")),
        );
        assert!(builder.add_rule(hidden).is_err());

        let first_join = noop(
            RuleDefinition::new("first").pattern(Pattern::new("A").join_on("x", Operator::Equal, "y")),
        );
        assert!(builder.add_rule(first_join).is_err());

        let whole_fact_index = noop(
            RuleDefinition::new("whole")
                .pattern(Pattern::new("A").bind("a"))
                .pattern(Pattern::new("B").join_on("value", Operator::Equal, "a")),
        );
        assert!(builder.add_rule(whole_fact_index).is_err());

        assert_eq!(builder.rule_count(), 0);
        builder.add_rule(a_then_b("ok")).unwrap();
        assert!(builder.add_rule(a_then_b("ok")).is_err());
        assert_eq!(builder.build().unwrap().nodes().len(), 5);
    }

    #[test]
    fn test_remove_rule_detaches_unused_nodes() {
        let mut builder = NetworkBuilder::new(&config(1));
        builder.add_rule(a_then_b("keep")).unwrap();
        builder
            .add_rule(noop(
                RuleDefinition::new("drop")
                    .pattern(Pattern::new("A").bind_field("v", "value"))
                    .accumulate(AccumulateSpec::new(Pattern::new("C"), Aggregate::count()).bind("n")),
            ))
            .unwrap();
        builder.remove_rule("drop").unwrap();
        assert!(builder.remove_rule("drop").is_err());

        let network = builder.build().unwrap();
        assert_eq!(network.rules().len(), 1);
        assert!(network.object_type("C").is_none());
        assert_eq!(network.nodes().len(), 5);
        assert!(matches!(network.nodes()[4].kind, NodeKind::Terminal { rule: 0 }));
    }

    #[test]
    fn test_assign_partition_and_single_thread_fallback() {
        let rules = || {
            [
                noop(RuleDefinition::new("a").pattern(Pattern::new("A"))),
                noop(RuleDefinition::new("b").pattern(Pattern::new("B"))),
            ]
        };
        let mut builder = NetworkBuilder::new(&config(2));
        for rule in rules() {
            builder.add_rule(rule).unwrap();
        }
        builder.assign_partition("b", 0).unwrap();
        assert!(builder.assign_partition("b", 2).is_err());
        let network = builder.build().unwrap();
        assert!(!network.is_partitioned());
        assert_eq!(network.used_partitions(), 1);

        let single = EngineConfig { multithread_evaluation: false, ..config(2) };
        let network = Network::from_rules(&single, rules()).unwrap();
        assert!(!network.is_partitioned());
        assert!(network.nodes().iter().filter_map(|n| n.partition).all(|p| p == 0));
    }

    #[test]
    fn test_async_nodes_and_receivers() {
        let send = RuleDefinition::new("send")
            .pattern(Pattern::new("Order").bind_field("amount", "amount"))
            .send(SendSpec::new("quotes", |m| Ok(m.value("amount").cloned().unwrap_or(FactValue::Null))));
        let receive = noop(
            RuleDefinition::new("receive")
                .pattern(Pattern::new("Quote"))
                .receive(ReceiveSpec::new("quotes").bind("price")),
        );
        let network = Network::from_rules(&config(1), [send, receive]).unwrap();
        assert_eq!(network.receivers().len(), 1);
        assert_eq!(network.receivers()[0].message_id, "quotes");
        assert!(network.rule("send").unwrap().action.is_none());
        let end = network.rule("send").unwrap().end;
        assert!(matches!(network.nodes()[end].kind, NodeKind::AsyncSend { .. }));
        let receive_node = &network.nodes()[network.receivers()[0].node];
        assert!(!receive_node.kind.has_link_bit());
        assert!(receive_node.object_parent.is_none());
    }
}
