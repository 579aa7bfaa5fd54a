//! Method identity as reported by the target's runtime

use super::types::MethodId;

/// Namespace assigned to types that live outside any namespace.
pub const GLOBAL_NAMESPACE: &str = "::";

/// One method (or a synthetic grouping node), resolved once per id.
///
/// Shared by every call record and graph node that refers to the method,
/// so it is never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodIdentity {
    id: MethodId,
    full_name: String,
    namespace: Option<String>,
    type_name: Option<String>,
    name: String,
    is_method: bool,
}

impl MethodIdentity {
    /// Identity of a real method, parsed from its fully qualified name.
    #[must_use]
    pub fn new(id: MethodId, full_name: impl Into<String>) -> Self {
        Self::parse(id, full_name.into(), true)
    }

    /// Identity of a namespace/type container used only for grouping.
    #[must_use]
    pub fn container(id: MethodId, full_name: impl Into<String>) -> Self {
        Self::parse(id, full_name.into(), false)
    }

    /// Placeholder for an id whose name could not be fetched.
    #[must_use]
    pub fn unresolved(id: MethodId) -> Self {
        Self::parse(id, format!("#{id}"), true)
    }

    // "Ns.Sub.Type.Method" -> namespace "Ns.Sub", type "Type", name "Method"
    fn parse(id: MethodId, full_name: String, is_method: bool) -> Self {
        let (namespace, type_name, name) = match full_name.rsplit_once('.') {
            Some((qualified_type, name)) => match qualified_type.rsplit_once('.') {
                Some((ns, ty)) => (Some(ns.to_string()), Some(ty.to_string()), name.to_string()),
                None if is_method => (
                    Some(GLOBAL_NAMESPACE.to_string()),
                    Some(qualified_type.to_string()),
                    name.to_string(),
                ),
                None => (None, Some(qualified_type.to_string()), name.to_string()),
            },
            None => (None, None, full_name.clone()),
        };

        Self { id, full_name, namespace, type_name, name, is_method }
    }

    #[must_use]
    pub fn id(&self) -> MethodId {
        self.id
    }

    #[must_use]
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    #[must_use]
    pub fn type_name(&self) -> Option<&str> {
        self.type_name.as_deref()
    }

    /// Short method name (the last `.` segment)
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// False for synthetic namespace/type containers
    #[must_use]
    pub fn is_method(&self) -> bool {
        self.is_method
    }

    /// `namespace.type`, or `None` when the name carries no type
    #[must_use]
    pub fn qualified_type(&self) -> Option<String> {
        let ty = self.type_name.as_deref()?;
        Some(match self.namespace.as_deref() {
            Some(ns) => format!("{ns}.{ty}"),
            None => format!("{GLOBAL_NAMESPACE}.{ty}"),
        })
    }

    /// Two identities match when they name the same runtime method.
    #[must_use]
    pub fn matches(&self, other: &MethodIdentity) -> bool {
        self.id == other.id
    }
}
