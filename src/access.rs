use std::collections::HashSet;

pub const PERM_INTAKE: &str = "admissions.intake";
pub const PERM_EVALUATE: &str = "admissions.evaluate";
pub const PERM_VERIFY: &str = "admissions.verify";
pub const PERM_DECIDE: &str = "admissions.decide";
pub const PERM_ENROLL: &str = "admissions.enroll";
pub const PERM_MANAGE_SCHOOL: &str = "school.manage";

/// Explicit actor context carried by every mutating request: the caller
/// states who is acting and which permission strings they hold, and handlers
/// check the one permission their operation requires before touching the
/// database.
#[derive(Debug, Clone)]
pub struct Actor {
    pub name: String,
    permissions: HashSet<String>,
}

impl Actor {
    pub fn from_params(params: &serde_json::Value) -> Option<Actor> {
        let actor = params.get("actor")?;
        let name = actor.get("name")?.as_str()?.trim().to_string();
        if name.is_empty() {
            return None;
        }
        let permissions = actor
            .get("permissions")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect::<HashSet<_>>()
            })
            .unwrap_or_default();
        Some(Actor { name, permissions })
    }

    pub fn can(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    /// Parse the actor out of `params` and check one permission. The error
    /// message is caller-facing; handlers wrap it in a `forbidden` envelope.
    pub fn require(params: &serde_json::Value, permission: &str) -> Result<Actor, String> {
        let Some(actor) = Actor::from_params(params) else {
            return Err("missing params.actor (name + permissions)".to_string());
        };
        if !actor.can(permission) {
            return Err(format!(
                "actor '{}' lacks permission '{}'",
                actor.name, permission
            ));
        }
        Ok(actor)
    }

    #[cfg(test)]
    pub fn with_permissions(name: &str, permissions: &[&str]) -> Actor {
        Actor {
            name: name.to_string(),
            permissions: permissions.iter().map(|s| s.to_string()).collect(),
        }
    }
}
