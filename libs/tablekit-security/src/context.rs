use uuid::Uuid;

use crate::actor::ActorId;

/// `SecurityContext` carries who is performing a data-access call.
///
/// Built by the calling adapter for every request and handed to
/// `Service::session`. The data layer reads it to fill create/update/delete
/// actor columns and to pick the locale used when rendering audit messages.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SecurityContext {
    /// Subject ID of the authenticated user, service, or system.
    subject_id: Uuid,
    /// Subject type classification (e.g., "user", "service").
    subject_type: Option<String>,
    /// Subject's home tenant, when the deployment is multi-tenant.
    tenant_id: Option<Uuid>,
    /// Value written into actor columns. Defaults to the subject ID.
    #[serde(default)]
    actor: Option<ActorId>,
    /// Preferred locale tag for human-readable output (e.g. "en", "zh-CN").
    #[serde(default)]
    locale: Option<String>,
}

impl SecurityContext {
    /// Create a new `SecurityContext` builder
    #[must_use]
    pub fn builder() -> SecurityContextBuilder {
        SecurityContextBuilder::default()
    }

    /// Create an anonymous `SecurityContext` (nil subject, no tenant, no actor override)
    #[must_use]
    pub fn anonymous() -> Self {
        SecurityContextBuilder::default().build()
    }

    #[must_use]
    pub fn subject_id(&self) -> Uuid {
        self.subject_id
    }

    #[must_use]
    pub fn subject_type(&self) -> Option<&str> {
        self.subject_type.as_deref()
    }

    #[must_use]
    pub fn tenant_id(&self) -> Option<Uuid> {
        self.tenant_id
    }

    /// Actor recorded in audit columns: the explicit actor if one was set,
    /// otherwise the subject ID.
    #[must_use]
    pub fn actor(&self) -> ActorId {
        self.actor
            .clone()
            .unwrap_or(ActorId::Uuid(self.subject_id))
    }

    #[must_use]
    pub fn locale(&self) -> Option<&str> {
        self.locale.as_deref()
    }

    /// Whether this context represents nobody in particular.
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.subject_id.is_nil() && self.actor.is_none()
    }
}

#[derive(Default)]
pub struct SecurityContextBuilder {
    subject_id: Option<Uuid>,
    subject_type: Option<String>,
    tenant_id: Option<Uuid>,
    actor: Option<ActorId>,
    locale: Option<String>,
}

impl SecurityContextBuilder {
    #[must_use]
    pub fn subject_id(mut self, subject_id: Uuid) -> Self {
        self.subject_id = Some(subject_id);
        self
    }

    #[must_use]
    pub fn subject_type(mut self, subject_type: &str) -> Self {
        self.subject_type = Some(subject_type.to_owned());
        self
    }

    #[must_use]
    pub fn tenant_id(mut self, tenant_id: Uuid) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    #[must_use]
    pub fn actor(mut self, actor: impl Into<ActorId>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    #[must_use]
    pub fn locale(mut self, locale: &str) -> Self {
        self.locale = Some(locale.to_owned());
        self
    }

    #[must_use]
    pub fn build(self) -> SecurityContext {
        SecurityContext {
            subject_id: self.subject_id.unwrap_or_default(),
            subject_type: self.subject_type,
            tenant_id: self.tenant_id,
            actor: self.actor,
            locale: self.locale,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_security_context_builder_full() {
        let subject_id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440001").unwrap();
        let tenant_id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440002").unwrap();

        let ctx = SecurityContext::builder()
            .subject_id(subject_id)
            .subject_type("user")
            .tenant_id(tenant_id)
            .actor(17_i64)
            .locale("zh-CN")
            .build();

        assert_eq!(ctx.subject_id(), subject_id);
        assert_eq!(ctx.subject_type(), Some("user"));
        assert_eq!(ctx.tenant_id(), Some(tenant_id));
        assert_eq!(ctx.actor(), ActorId::Int(17));
        assert_eq!(ctx.locale(), Some("zh-CN"));
        assert!(!ctx.is_anonymous());
    }

    #[test]
    fn test_actor_defaults_to_subject() {
        let subject_id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440001").unwrap();
        let ctx = SecurityContext::builder().subject_id(subject_id).build();

        assert_eq!(ctx.actor(), ActorId::Uuid(subject_id));
    }

    #[test]
    fn test_security_context_anonymous() {
        let ctx = SecurityContext::anonymous();

        assert_eq!(ctx.subject_id(), Uuid::default());
        assert!(ctx.tenant_id().is_none());
        assert!(ctx.locale().is_none());
        assert!(ctx.is_anonymous());
    }

    #[test]
    fn test_security_context_serialize_deserialize() {
        let subject_id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440001").unwrap();

        let original = SecurityContext::builder()
            .subject_id(subject_id)
            .subject_type("service")
            .actor("batch-import")
            .build();

        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: SecurityContext = serde_json::from_str(&serialized).unwrap();

        assert_eq!(deserialized.subject_id(), original.subject_id());
        assert_eq!(deserialized.subject_type(), Some("service"));
        assert_eq!(deserialized.actor(), ActorId::Name("batch-import".to_owned()));
    }
}
