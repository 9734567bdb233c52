use uuid::Uuid;

use sarhni_db::Database;
use sarhni_types::models::Role;

use crate::error::ApiError;
use crate::middleware::Session;

/// The signed-in caller, as currently recorded in the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: Uuid,
    pub username: String,
    pub role: Role,
}

impl AuthUser {
    pub fn is_moderator(&self) -> bool {
        self.role.is_moderator()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allowed,
    Denied(&'static str),
}

impl Access {
    pub fn is_allowed(self) -> bool {
        matches!(self, Access::Allowed)
    }

    pub fn into_result(self) -> Result<(), ApiError> {
        match self {
            Access::Allowed => Ok(()),
            Access::Denied(reason) => Err(ApiError::forbidden(reason)),
        }
    }
}

/// Resolve the session to a live account.
///
/// The token only proves who the caller was when it was issued, so the
/// account is re-read: a deleted or since-banned user counts as anonymous,
/// and the stored role wins over the one in the token.
pub fn current_user(db: &Database, session: &Session) -> Result<Option<AuthUser>, ApiError> {
    let Some(claims) = session.claims() else {
        return Ok(None);
    };
    if claims.banned {
        return Ok(None);
    }

    let Some(row) = db.get_user_by_id(claims.sub)? else {
        return Ok(None);
    };
    if row.is_banned {
        return Ok(None);
    }

    Ok(Some(AuthUser {
        id: row.id,
        username: row.username,
        role: row.role,
    }))
}

pub fn require_auth(db: &Database, session: &Session) -> Result<AuthUser, ApiError> {
    current_user(db, session)?.ok_or(ApiError::Unauthorized)
}

pub fn require_role(db: &Database, session: &Session, min: Role) -> Result<AuthUser, ApiError> {
    let user = require_auth(db, session)?;
    if user.role < min {
        return Err(ApiError::forbidden("Insufficient permissions"));
    }
    Ok(user)
}

/// Role hierarchy only: an OWNER acts on anyone below OWNER, an ADMIN on
/// plain users, a USER on nobody.
pub fn may_act_on(actor: Role, target: Role) -> bool {
    match actor {
        Role::Owner => target != Role::Owner,
        Role::Admin => target == Role::User,
        Role::User => false,
    }
}

/// Whether `actor` may moderate the account `target_id`. Acting on oneself
/// is always allowed here; operations that forbid it check separately.
pub fn can_act_on_user(db: &Database, actor: &AuthUser, target_id: Uuid) -> Result<Access, ApiError> {
    if actor.id == target_id {
        return Ok(Access::Allowed);
    }
    let Some(target) = db.get_user_by_id(target_id)? else {
        return Ok(Access::Denied("User not found"));
    };
    if may_act_on(actor.role, target.role) {
        Ok(Access::Allowed)
    } else {
        Ok(Access::Denied("You cannot modify a user with an equal or higher role"))
    }
}

/// Denies demoting or erasing the only remaining OWNER. The database layer
/// repeats this check inside its transaction.
pub fn can_demote_last_owner(db: &Database, target_id: Uuid) -> Result<Access, ApiError> {
    let Some(target) = db.get_user_by_id(target_id)? else {
        return Ok(Access::Allowed);
    };
    if target.role == Role::Owner && db.count_owners()? <= 1 {
        return Ok(Access::Denied("Cannot remove the last owner"));
    }
    Ok(Access::Allowed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestUser, test_db};

    #[test]
    fn anonymous_session_has_no_user() {
        let db = test_db();
        assert_eq!(current_user(&db, &Session::anonymous()).unwrap(), None);
        assert!(matches!(
            require_auth(&db, &Session::anonymous()),
            Err(ApiError::Unauthorized)
        ));
    }

    #[test]
    fn banned_users_are_treated_as_anonymous() {
        let db = test_db();
        let owner = TestUser::create(&db, "owner", Role::Owner);
        let user = TestUser::create(&db, "mallory", Role::User);

        assert!(current_user(&db, &user.session()).unwrap().is_some());
        db.set_banned(user.id, true).unwrap();
        assert_eq!(current_user(&db, &user.session()).unwrap(), None);

        let mut stale = owner.session();
        if let Some(claims) = stale.0.as_mut() {
            claims.banned = true;
        }
        assert_eq!(current_user(&db, &stale).unwrap(), None);
    }

    #[test]
    fn stored_role_overrides_token_role() {
        let db = test_db();
        let _owner = TestUser::create(&db, "owner", Role::Owner);
        let admin = TestUser::create(&db, "admin", Role::Admin);
        let session = admin.session();

        db.change_role(admin.id, Role::User).unwrap();
        assert!(matches!(
            require_role(&db, &session, Role::Admin),
            Err(ApiError::Forbidden(_))
        ));
    }

    #[test]
    fn role_hierarchy() {
        assert!(may_act_on(Role::Owner, Role::Admin));
        assert!(may_act_on(Role::Owner, Role::User));
        assert!(!may_act_on(Role::Owner, Role::Owner));
        assert!(may_act_on(Role::Admin, Role::User));
        assert!(!may_act_on(Role::Admin, Role::Admin));
        assert!(!may_act_on(Role::Admin, Role::Owner));
        assert!(!may_act_on(Role::User, Role::User));
    }

    #[test]
    fn acting_on_users() {
        let db = test_db();
        let owner = TestUser::create(&db, "owner", Role::Owner);
        let admin = TestUser::create(&db, "admin", Role::Admin);
        let user = TestUser::create(&db, "user", Role::User);

        let admin_actor = admin.auth();
        assert!(can_act_on_user(&db, &admin_actor, user.id).unwrap().is_allowed());
        assert!(!can_act_on_user(&db, &admin_actor, owner.id).unwrap().is_allowed());
        assert!(can_act_on_user(&db, &admin_actor, admin.id).unwrap().is_allowed());
        assert_eq!(
            can_act_on_user(&db, &admin_actor, Uuid::new_v4()).unwrap(),
            Access::Denied("User not found")
        );
    }

    #[test]
    fn last_owner_cannot_be_demoted() {
        let db = test_db();
        let owner = TestUser::create(&db, "owner", Role::Owner);
        assert!(!can_demote_last_owner(&db, owner.id).unwrap().is_allowed());

        let second = TestUser::create(&db, "second", Role::Owner);
        assert!(can_demote_last_owner(&db, owner.id).unwrap().is_allowed());
        assert!(can_demote_last_owner(&db, second.id).unwrap().is_allowed());
    }
}
