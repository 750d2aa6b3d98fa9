/**
 * SUBJECT AUTHORITY - Grammaire d'adressage et contrôle d'accès par tenant
 *
 * RÔLE :
 * Définit la grammaire hiérarchique des sujets et tranche allow/deny pour
 * chaque publish/subscribe selon le scope du credential appelant.
 *
 * GRAMMAIRE :
 * - tenant.<tenant_id>.device.<device_id>.<message_type>
 * - admin.device.register / admin.tenant.<tenant_id>.<action> / admin.health.<component>
 *
 * RÈGLES :
 * - Le segment tenant doit être EXACTEMENT le tenant lié au credential
 * - Wildcards autorisés seulement au niveau ou sous le préfixe du tenant appelant
 * - Un device ne publie que heartbeat/status/sysinfo/monitoring/response, et
 *   uniquement sous son propre device_id
 * - Les refus sont des erreurs explicites, jamais des drops silencieux
 */

use crate::errors::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Types de message admis sous un device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Heartbeat,
    Status,
    Command,
    Response,
    Sysinfo,
    Monitoring,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Heartbeat => "heartbeat",
            MessageType::Status => "status",
            MessageType::Command => "command",
            MessageType::Response => "response",
            MessageType::Sysinfo => "sysinfo",
            MessageType::Monitoring => "monitoring",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "heartbeat" => Some(MessageType::Heartbeat),
            "status" => Some(MessageType::Status),
            "command" => Some(MessageType::Command),
            "response" => Some(MessageType::Response),
            "sysinfo" => Some(MessageType::Sysinfo),
            "monitoring" => Some(MessageType::Monitoring),
            _ => None,
        }
    }

    /// Types qu'un credential device a le droit de publier lui-même.
    pub fn device_publishable(&self) -> bool {
        !matches!(self, MessageType::Command)
    }
}

/// Sujet concret, déjà validé contre la grammaire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    Device {
        tenant: String,
        device: String,
        kind: MessageType,
    },
    AdminRegister,
    AdminTenant { tenant: String, action: String },
    AdminHealth { component: String },
}

impl Subject {
    pub fn device(tenant: &str, device: &str, kind: MessageType) -> Self {
        Subject::Device {
            tenant: tenant.to_string(),
            device: device.to_string(),
            kind,
        }
    }

    /// Parse une chaîne de sujet pointée. Malformé = erreur de schéma.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let parts: Vec<&str> = raw.split('.').collect();
        match parts.as_slice() {
            ["tenant", tenant, "device", device, kind] => {
                check_segment(tenant)?;
                check_segment(device)?;
                let kind = MessageType::parse(kind)
                    .ok_or_else(|| CoreError::Schema(format!("unknown message type '{kind}' in subject '{raw}'")))?;
                Ok(Subject::Device {
                    tenant: tenant.to_string(),
                    device: device.to_string(),
                    kind,
                })
            }
            ["admin", "device", "register"] => Ok(Subject::AdminRegister),
            ["admin", "tenant", tenant, action] => {
                check_segment(tenant)?;
                check_segment(action)?;
                Ok(Subject::AdminTenant {
                    tenant: tenant.to_string(),
                    action: action.to_string(),
                })
            }
            ["admin", "health", component] => {
                check_segment(component)?;
                Ok(Subject::AdminHealth {
                    component: component.to_string(),
                })
            }
            _ => Err(CoreError::Schema(format!("malformed subject '{raw}'"))),
        }
    }

    /// Segment tenant du sujet, s'il y en a un.
    pub fn tenant(&self) -> Option<&str> {
        match self {
            Subject::Device { tenant, .. } | Subject::AdminTenant { tenant, .. } => Some(tenant),
            _ => None,
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Device { tenant, device, kind } => {
                write!(f, "tenant.{tenant}.device.{device}.{}", kind.as_str())
            }
            Subject::AdminRegister => write!(f, "admin.device.register"),
            Subject::AdminTenant { tenant, action } => write!(f, "admin.tenant.{tenant}.{action}"),
            Subject::AdminHealth { component } => write!(f, "admin.health.{component}"),
        }
    }
}

/// Pattern d'abonnement : segments littéraux, `*` (un segment) ou `>` (queue).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectPattern {
    raw: String,
    segments: Vec<PatternToken>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternToken {
    Literal(String),
    AnyOne,
    Tail,
}

impl SubjectPattern {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        if raw.is_empty() {
            return Err(CoreError::Schema("empty subject pattern".into()));
        }
        let mut segments = Vec::new();
        let parts: Vec<&str> = raw.split('.').collect();
        for (i, part) in parts.iter().enumerate() {
            match *part {
                ">" => {
                    if i != parts.len() - 1 {
                        return Err(CoreError::Schema(format!(
                            "'>' only allowed as last segment in '{raw}'"
                        )));
                    }
                    segments.push(PatternToken::Tail);
                }
                "*" => segments.push(PatternToken::AnyOne),
                lit => {
                    check_segment(lit)?;
                    segments.push(PatternToken::Literal(lit.to_string()));
                }
            }
        }
        Ok(Self { raw: raw.to_string(), segments })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Match NATS-like : `*` couvre un segment, `>` un ou plusieurs en fin.
    pub fn matches(&self, subject: &str) -> bool {
        let parts: Vec<&str> = subject.split('.').collect();
        let mut idx = 0;
        for token in &self.segments {
            match token {
                PatternToken::Tail => return idx < parts.len(),
                PatternToken::AnyOne => {
                    if idx >= parts.len() {
                        return false;
                    }
                    idx += 1;
                }
                PatternToken::Literal(lit) => {
                    if parts.get(idx).map(|p| *p == lit) != Some(true) {
                        return false;
                    }
                    idx += 1;
                }
            }
        }
        idx == parts.len()
    }

    /// Tenant littéral en tête de pattern (`tenant.<id>...`), sinon None.
    /// Un wildcard en position tenant ne compte pas : ce serait cross-tenant.
    pub fn tenant_prefix(&self) -> Option<&str> {
        match (self.segments.first(), self.segments.get(1)) {
            (Some(PatternToken::Literal(head)), Some(PatternToken::Literal(tenant)))
                if head == "tenant" =>
            {
                Some(tenant)
            }
            _ => None,
        }
    }

    /// Les quatre premiers segments littéraux `tenant.<t>.device.<d>`, si présents.
    fn device_prefix(&self) -> Option<(&str, &str)> {
        let tenant = self.tenant_prefix()?;
        match (self.segments.get(2), self.segments.get(3)) {
            (Some(PatternToken::Literal(dev_kw)), Some(PatternToken::Literal(device)))
                if dev_kw == "device" =>
            {
                Some((tenant, device))
            }
            _ => None,
        }
    }
}

impl fmt::Display for SubjectPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Scope d'un credential, fixé au provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Scope {
    /// Le service central lui-même : namespace admin + visibilité cross-tenant.
    Service,
    /// Credential lié à un tenant : tout le namespace du tenant, rien d'autre.
    Tenant { tenant: String },
    /// Credential émis pour un device précis lors du handshake.
    Device { tenant: String, device: String },
}

/// Contrat central : allow/deny pour un publish.
pub fn authorize_publish(scope: &Scope, subject: &Subject) -> Result<(), CoreError> {
    match scope {
        Scope::Service => Ok(()),
        Scope::Tenant { tenant } => match subject {
            Subject::Device { tenant: t, .. } if t == tenant => Ok(()),
            _ => Err(deny_publish(scope, subject)),
        },
        Scope::Device { tenant, device } => match subject {
            Subject::Device { tenant: t, device: d, kind }
                if t == tenant && d == device && kind.device_publishable() =>
            {
                Ok(())
            }
            _ => Err(deny_publish(scope, subject)),
        },
    }
}

/// Contrat central : allow/deny pour un abonnement (pattern avec wildcards).
pub fn authorize_subscribe(scope: &Scope, pattern: &SubjectPattern) -> Result<(), CoreError> {
    match scope {
        Scope::Service => Ok(()),
        Scope::Tenant { tenant } => match pattern.tenant_prefix() {
            Some(t) if t == tenant => Ok(()),
            _ => Err(deny_subscribe(scope, pattern)),
        },
        Scope::Device { tenant, device } => match pattern.device_prefix() {
            Some((t, d)) if t == tenant && d == device => Ok(()),
            _ => Err(deny_subscribe(scope, pattern)),
        },
    }
}

fn deny_publish(scope: &Scope, subject: &Subject) -> CoreError {
    CoreError::Authorization(format!("scope {scope:?} may not publish on '{subject}'"))
}

fn deny_subscribe(scope: &Scope, pattern: &SubjectPattern) -> CoreError {
    CoreError::Authorization(format!("scope {scope:?} may not subscribe to '{pattern}'"))
}

fn check_segment(s: &str) -> Result<(), CoreError> {
    if s.is_empty() || !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(CoreError::Schema(format!("invalid subject segment '{s}'")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant_scope(t: &str) -> Scope {
        Scope::Tenant { tenant: t.to_string() }
    }

    fn device_scope(t: &str, d: &str) -> Scope {
        Scope::Device { tenant: t.to_string(), device: d.to_string() }
    }

    #[test]
    fn test_parse_roundtrip() {
        let raw = "tenant.acme.device.dev-1.heartbeat";
        let subject = Subject::parse(raw).unwrap();
        assert_eq!(subject, Subject::device("acme", "dev-1", MessageType::Heartbeat));
        assert_eq!(subject.to_string(), raw);

        assert_eq!(Subject::parse("admin.device.register").unwrap(), Subject::AdminRegister);
        assert_eq!(
            Subject::parse("admin.tenant.acme.rotate").unwrap().to_string(),
            "admin.tenant.acme.rotate"
        );
        assert_eq!(
            Subject::parse("admin.health.kernel").unwrap().to_string(),
            "admin.health.kernel"
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Subject::parse("tenant.acme.device.dev-1.telepathy").is_err());
        assert!(Subject::parse("tenant.acme.device.dev-1").is_err());
        assert!(Subject::parse("tenant..device.d.status").is_err());
        assert!(Subject::parse("bogus.acme").is_err());
    }

    #[test]
    fn test_tenant_isolation_publish() {
        // Invariant d'isolation : t1 refusé sur tous les sujets de t2.
        let scope = tenant_scope("t1");
        for kind in [
            MessageType::Heartbeat,
            MessageType::Status,
            MessageType::Command,
            MessageType::Response,
            MessageType::Sysinfo,
            MessageType::Monitoring,
        ] {
            let theirs = Subject::device("t2", "dev-1", kind);
            assert!(matches!(
                authorize_publish(&scope, &theirs),
                Err(CoreError::Authorization(_))
            ));
            let ours = Subject::device("t1", "dev-1", kind);
            assert!(authorize_publish(&scope, &ours).is_ok());
        }
    }

    #[test]
    fn test_tenant_denied_on_admin() {
        let scope = tenant_scope("t1");
        assert!(authorize_publish(&scope, &Subject::AdminRegister).is_err());
        let own_admin = Subject::parse("admin.tenant.t1.rotate").unwrap();
        assert!(authorize_publish(&scope, &own_admin).is_err());
    }

    #[test]
    fn test_cross_tenant_wildcards_always_deny() {
        let scope = tenant_scope("t1");
        for pat in ["tenant.>", "tenant.*.device.>", "tenant.t2.device.>", ">"] {
            let pattern = SubjectPattern::parse(pat).unwrap();
            assert!(
                authorize_subscribe(&scope, &pattern).is_err(),
                "pattern '{pat}' should be denied"
            );
        }
        let own = SubjectPattern::parse("tenant.t1.device.>").unwrap();
        assert!(authorize_subscribe(&scope, &own).is_ok());
        let own_narrow = SubjectPattern::parse("tenant.t1.device.*.heartbeat").unwrap();
        assert!(authorize_subscribe(&scope, &own_narrow).is_ok());
    }

    #[test]
    fn test_device_publish_rules() {
        let scope = device_scope("t1", "dev-1");
        // Son propre id : tout sauf command.
        assert!(authorize_publish(&scope, &Subject::device("t1", "dev-1", MessageType::Heartbeat)).is_ok());
        assert!(authorize_publish(&scope, &Subject::device("t1", "dev-1", MessageType::Response)).is_ok());
        assert!(authorize_publish(&scope, &Subject::device("t1", "dev-1", MessageType::Command)).is_err());
        // Jamais le chemin d'un autre device ou tenant.
        assert!(authorize_publish(&scope, &Subject::device("t1", "dev-2", MessageType::Heartbeat)).is_err());
        assert!(authorize_publish(&scope, &Subject::device("t2", "dev-1", MessageType::Heartbeat)).is_err());
    }

    #[test]
    fn test_device_subscribe_own_command_only() {
        let scope = device_scope("t1", "dev-1");
        let own_cmd = SubjectPattern::parse("tenant.t1.device.dev-1.command").unwrap();
        assert!(authorize_subscribe(&scope, &own_cmd).is_ok());
        let sibling = SubjectPattern::parse("tenant.t1.device.dev-2.command").unwrap();
        assert!(authorize_subscribe(&scope, &sibling).is_err());
        let broad = SubjectPattern::parse("tenant.t1.device.>").unwrap();
        assert!(authorize_subscribe(&scope, &broad).is_err());
    }

    #[test]
    fn test_pattern_matching() {
        let tail = SubjectPattern::parse("tenant.t1.device.>").unwrap();
        assert!(tail.matches("tenant.t1.device.dev-1.heartbeat"));
        assert!(!tail.matches("tenant.t2.device.dev-1.heartbeat"));
        assert!(!tail.matches("tenant.t1.device"));

        let one = SubjectPattern::parse("tenant.t1.device.*.status").unwrap();
        assert!(one.matches("tenant.t1.device.dev-9.status"));
        assert!(!one.matches("tenant.t1.device.dev-9.heartbeat"));

        let exact = SubjectPattern::parse("admin.health.kernel").unwrap();
        assert!(exact.matches("admin.health.kernel"));
        assert!(!exact.matches("admin.health.kernel.extra"));
    }

    #[test]
    fn test_pattern_rejects_inner_tail() {
        assert!(SubjectPattern::parse("tenant.>.device").is_err());
        assert!(SubjectPattern::parse("").is_err());
    }
}
