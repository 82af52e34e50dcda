//! Composable predicates over entities and their members.
//!
//! Evaluation threads an explicit accumulator through the predicate tree, so
//! a [`Criteria`] is immutable and can be tested from many threads at once.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::entity::Entity;

type EntityPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;
type MemberPredicate<M> = Arc<dyn Fn(&M) -> bool + Send + Sync>;

/// A named predicate over the members of an entity.
pub struct MemberCriterion<E: Entity> {
    name: Arc<str>,
    predicate: MemberPredicate<E::Member>,
}

impl<E: Entity> MemberCriterion<E> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn test(&self, member: &E::Member) -> bool {
        (self.predicate)(member)
    }
}

impl<E: Entity> Clone for MemberCriterion<E> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            predicate: Arc::clone(&self.predicate),
        }
    }
}

enum Node<E: Entity> {
    Entity(EntityPredicate<E>),
    Members(MemberCriterion<E>),
    And(Box<Node<E>>, Box<Node<E>>),
    Or(Box<Node<E>>, Box<Node<E>>),
    Not(Box<Node<E>>),
}

impl<E: Entity> Clone for Node<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Entity(p) => Self::Entity(Arc::clone(p)),
            Self::Members(m) => Self::Members(m.clone()),
            Self::And(a, b) => Self::And(a.clone(), b.clone()),
            Self::Or(a, b) => Self::Or(a.clone(), b.clone()),
            Self::Not(a) => Self::Not(a.clone()),
        }
    }
}

impl<E: Entity> fmt::Debug for Node<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entity(_) => f.write_str("entity(..)"),
            Self::Members(m) => write!(f, "members({})", m.name),
            Self::And(a, b) => write!(f, "({a:?} and {b:?})"),
            Self::Or(a, b) => write!(f, "({a:?} or {b:?})"),
            Self::Not(a) => write!(f, "not {a:?}"),
        }
    }
}

struct Accumulator<M> {
    collect: bool,
    found: BTreeMap<String, Vec<M>>,
}

impl<E: Entity> Node<E> {
    fn eval(&self, entity: &E, acc: &mut Accumulator<E::Member>) -> bool {
        match self {
            Self::Entity(predicate) => predicate(entity),
            Self::Members(criterion) => {
                if !acc.collect {
                    return entity.members().iter().any(|m| criterion.test(m));
                }
                let matched: Vec<E::Member> = entity
                    .members()
                    .iter()
                    .filter(|m| criterion.test(m))
                    .cloned()
                    .collect();
                if matched.is_empty() {
                    return false;
                }
                let slot = acc.found.entry(criterion.name().to_string()).or_default();
                for member in matched {
                    if !slot.contains(&member) {
                        slot.push(member);
                    }
                }
                true
            }
            Self::And(a, b) => a.eval(entity, acc) && b.eval(entity, acc),
            Self::Or(a, b) => {
                if acc.collect {
                    // both sides run so every matching member is recorded
                    let left = a.eval(entity, acc);
                    let right = b.eval(entity, acc);
                    left || right
                } else {
                    a.eval(entity, acc) || b.eval(entity, acc)
                }
            }
            Self::Not(a) => {
                let mut scratch = Accumulator {
                    collect: false,
                    found: BTreeMap::new(),
                };
                !a.eval(entity, &mut scratch)
            }
        }
    }
}

/// Outcome of testing one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct TestResult<M> {
    pub matched: bool,
    /// Criterion name to the members that satisfied it. Empty unless the
    /// criteria collects members and the entity matched.
    pub members_found: BTreeMap<String, Vec<M>>,
}

impl<M> TestResult<M> {
    fn unmatched() -> Self {
        Self {
            matched: false,
            members_found: BTreeMap::new(),
        }
    }
}

pub struct Criteria<E: Entity> {
    predicate: Option<Node<E>>,
    collect_members: bool,
}

impl<E: Entity> Clone for Criteria<E> {
    fn clone(&self) -> Self {
        Self {
            predicate: self.predicate.clone(),
            collect_members: self.collect_members,
        }
    }
}

impl<E: Entity> fmt::Debug for Criteria<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Criteria")
            .field("predicate", &self.predicate)
            .field("collect_members", &self.collect_members)
            .finish()
    }
}

impl<E: Entity> Default for Criteria<E> {
    fn default() -> Self {
        Self::all()
    }
}

impl<E: Entity> Criteria<E> {
    /// No predicate: matches every entity, and a missing one.
    pub fn all() -> Self {
        Self {
            predicate: None,
            collect_members: false,
        }
    }

    pub fn by<F>(predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Some(Node::Entity(Arc::new(predicate))),
            collect_members: false,
        }
    }

    /// Matches entities with at least one member satisfying `predicate`;
    /// those members are recorded under `name` when collecting.
    pub fn by_members<F>(name: &str, predicate: F) -> Self
    where
        F: Fn(&E::Member) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Some(Node::Members(MemberCriterion {
                name: Arc::from(name),
                predicate: Arc::new(predicate),
            })),
            collect_members: false,
        }
    }

    pub fn and(self, other: Self) -> Self {
        let collect_members = self.collect_members || other.collect_members;
        let predicate = match (self.predicate, other.predicate) {
            (Some(a), Some(b)) => Some(Node::And(Box::new(a), Box::new(b))),
            (a, b) => a.or(b),
        };
        Self {
            predicate,
            collect_members,
        }
    }

    pub fn or(self, other: Self) -> Self {
        let collect_members = self.collect_members || other.collect_members;
        let predicate = match (self.predicate, other.predicate) {
            (Some(a), Some(b)) => Some(Node::Or(Box::new(a), Box::new(b))),
            _ => None,
        };
        Self {
            predicate,
            collect_members,
        }
    }

    pub fn collect_members(mut self, collect: bool) -> Self {
        self.collect_members = collect;
        self
    }

    pub fn is_collecting_members(&self) -> bool {
        self.collect_members
    }

    pub fn has_predicate(&self) -> bool {
        self.predicate.is_some()
    }

    /// Tests one entity. `None` matches only when there is no predicate.
    pub fn test(&self, entity: Option<&E>) -> TestResult<E::Member> {
        let (node, entity) = match (&self.predicate, entity) {
            (None, _) => {
                return TestResult {
                    matched: true,
                    members_found: BTreeMap::new(),
                };
            }
            (Some(_), None) => return TestResult::unmatched(),
            (Some(node), Some(entity)) => (node, entity),
        };
        let mut acc = Accumulator {
            collect: self.collect_members,
            found: BTreeMap::new(),
        };
        if node.eval(entity, &mut acc) {
            TestResult {
                matched: true,
                members_found: acc.found,
            }
        } else {
            TestResult::unmatched()
        }
    }

    pub fn matches(&self, entity: &E) -> bool {
        self.test(Some(entity)).matched
    }
}

impl<E: Entity> std::ops::Not for Criteria<E> {
    type Output = Self;

    fn not(self) -> Self {
        let predicate = match self.predicate {
            Some(node) => Node::Not(Box::new(node)),
            None => Node::Entity(Arc::new(|_: &E| false)),
        };
        Self {
            predicate: Some(predicate),
            collect_members: self.collect_members,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Item {
        key: String,
        members: Vec<String>,
    }

    impl Entity for Item {
        type Member = String;

        fn key(&self) -> &str {
            &self.key
        }

        fn members(&self) -> &[String] {
            &self.members
        }
    }

    fn item(key: &str, members: &[&str]) -> Item {
        Item {
            key: key.to_string(),
            members: members.iter().map(|m| m.to_string()).collect(),
        }
    }

    #[test]
    fn null_policy() {
        let none: Criteria<Item> = Criteria::all();
        assert!(none.test(None).matched);
        assert!(none.matches(&item("a", &[])));

        let some = Criteria::<Item>::by(|i| i.key.starts_with('a'));
        assert!(!some.test(None).matched);
        assert!(!(!some.clone()).test(None).matched);
    }

    #[test]
    fn boolean_composition() {
        let starts_a = Criteria::<Item>::by(|i| i.key.starts_with('a'));
        let long = Criteria::<Item>::by(|i| i.key.len() > 2);

        let both = starts_a.clone().and(long.clone());
        assert!(both.matches(&item("abc", &[])));
        assert!(!both.matches(&item("ab", &[])));

        let either = starts_a.clone().or(long.clone());
        assert!(either.matches(&item("xyz", &[])));
        assert!(!either.matches(&item("x", &[])));

        let not_a = !starts_a.clone();
        assert!(not_a.matches(&item("b", &[])));
        assert!(!not_a.matches(&item("a", &[])));

        assert!(!(!Criteria::<Item>::all()).matches(&item("a", &[])));
        assert!(Criteria::all().or(starts_a.clone()).matches(&item("b", &[])));
        assert!(!Criteria::all().and(starts_a).matches(&item("b", &[])));
    }

    #[test]
    fn members_are_recorded_per_criterion() {
        let runs = Criteria::<Item>::by_members("runs", |m| m.starts_with("run"));
        let stops = Criteria::<Item>::by_members("stops", |m| m.starts_with("stop"));
        let criteria = runs.or(stops).collect_members(true);

        let result = criteria.test(Some(&item("a", &["run", "runFast", "stop", "other"])));
        assert!(result.matched);
        assert_eq!(result.members_found["runs"], vec!["run".to_string(), "runFast".to_string()]);
        assert_eq!(result.members_found["stops"], vec!["stop".to_string()]);

        let silent = criteria.clone().collect_members(false).test(Some(&item("a", &["run"])));
        assert!(silent.matched);
        assert!(silent.members_found.is_empty());

        let missed = criteria.test(Some(&item("b", &["other"])));
        assert!(!missed.matched);
        assert!(missed.members_found.is_empty());
    }

    #[test]
    fn failed_conjunction_drops_partial_members() {
        let criteria = Criteria::<Item>::by_members("runs", |m| m == "run")
            .and(Criteria::by(|i: &Item| i.key == "wanted"))
            .collect_members(true);
        let result = criteria.test(Some(&item("other", &["run"])));
        assert!(!result.matched);
        assert!(result.members_found.is_empty());
    }
}
