use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{extract::State, http::StatusCode, response::IntoResponse};
use chrono::Utc;
use jsonwebtoken::{EncodingKey, Header, encode};
use tracing::info;
use uuid::Uuid;

use sarhni_db::models::NewUser;
use sarhni_types::api::{AuthResponse, Claims, LoginRequest, RegisterRequest};
use sarhni_types::models::{Role, User};

use crate::authz;
use crate::blocking;
use crate::error::ApiError;
use crate::extract::Json;
use crate::middleware::Session;
use crate::state::{AppState, AppStateInner};

const TOKEN_LIFETIME_DAYS: i64 = 30;

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = blocking(state, move |s| create_account(s, &req)).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let response = blocking(state, move |s| sign_in(s, &req)).await?;
    Ok(Json(response))
}

/// `GET /me`
pub async fn me(
    State(state): State<AppState>,
    session: Session,
) -> Result<Json<User>, ApiError> {
    let user = blocking(state, move |s| {
        let auth = authz::require_auth(&s.db, &session)?;
        s.db.get_user_by_id(auth.id)?
            .map(|row| row.into_public())
            .ok_or(ApiError::Unauthorized)
    })
    .await?;
    Ok(Json(user))
}

pub fn normalize_username(raw: &str) -> Result<String, ApiError> {
    let username = raw.trim().to_lowercase();
    let valid_chars = username
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !(3..=20).contains(&username.chars().count()) || !valid_chars {
        return Err(ApiError::validation(
            "Username must be 3-20 characters of letters, digits or underscores",
        ));
    }
    Ok(username)
}

pub fn create_account(state: &AppStateInner, req: &RegisterRequest) -> Result<AuthResponse, ApiError> {
    let username = normalize_username(&req.username)?;
    if !(8..=128).contains(&req.password.chars().count()) {
        return Err(ApiError::validation("Password must be 8-128 characters"));
    }

    // Hash password with Argon2id
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hashing failed: {e}"))?
        .to_string();

    let id = Uuid::new_v4();
    let role = state
        .db
        .register_user(&NewUser {
            id,
            username: &username,
            password_hash: &password_hash,
            created_at: Utc::now(),
        })?
        .ok_or_else(|| ApiError::rule("Username is already taken"))?;

    if role == Role::Owner {
        info!("First account {} registered as OWNER", username);
    }

    let token = create_token(&state.jwt_secret, id, &username, role, false)?;
    Ok(AuthResponse {
        user_id: id,
        username,
        role,
        token,
    })
}

pub fn sign_in(state: &AppStateInner, req: &LoginRequest) -> Result<AuthResponse, ApiError> {
    let username = req.username.trim().to_lowercase();
    let user = state
        .db
        .get_user_by_username(&username)?
        .ok_or(ApiError::InvalidCredentials)?;

    let parsed_hash = PasswordHash::new(&user.password)
        .map_err(|e| anyhow::anyhow!("stored hash for {} is unreadable: {e}", user.id))?;
    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| ApiError::InvalidCredentials)?;

    if user.is_banned {
        return Err(ApiError::forbidden("This account has been banned"));
    }

    let token = create_token(&state.jwt_secret, user.id, &user.username, user.role, false)?;
    Ok(AuthResponse {
        user_id: user.id,
        username: user.username,
        role: user.role,
        token,
    })
}

pub fn create_token(
    secret: &str,
    user_id: Uuid,
    username: &str,
    role: Role,
    banned: bool,
) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        role,
        banned,
        exp: (Utc::now() + chrono::Duration::days(TOKEN_LIFETIME_DAYS)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

#[cfg(test)]
mod tests {
    use jsonwebtoken::{DecodingKey, Validation, decode};

    use super::*;
    use crate::test_support::{TEST_SECRET, test_state};

    fn register_req(username: &str, password: &str) -> RegisterRequest {
        RegisterRequest {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    #[test]
    fn username_rules() {
        assert_eq!(normalize_username("  Alice_01 ").unwrap(), "alice_01");
        assert!(normalize_username("ab").is_err());
        assert!(normalize_username("this_name_is_way_too_long").is_err());
        assert!(normalize_username("no spaces").is_err());
        assert!(normalize_username("émile").is_err());
    }

    #[tokio::test]
    async fn first_account_becomes_owner() {
        let (state, _dir) = test_state().await;

        let first = create_account(&state, &register_req("Founder", "correct horse")).unwrap();
        assert_eq!(first.role, Role::Owner);
        assert_eq!(first.username, "founder");

        let second = create_account(&state, &register_req("bob", "correct horse")).unwrap();
        assert_eq!(second.role, Role::User);

        let claims = decode::<Claims>(
            &second.token,
            &DecodingKey::from_secret(TEST_SECRET.as_bytes()),
            &Validation::default(),
        )
        .unwrap()
        .claims;
        assert_eq!(claims.sub, second.user_id);
        assert_eq!(claims.role, Role::User);
        assert!(!claims.banned);
    }

    #[tokio::test]
    async fn duplicate_username_is_rejected() {
        let (state, _dir) = test_state().await;
        create_account(&state, &register_req("alice", "password1")).unwrap();
        let err = create_account(&state, &register_req("ALICE", "password2")).unwrap_err();
        assert!(matches!(err, ApiError::Rule(_)));
    }

    #[tokio::test]
    async fn short_password_is_rejected() {
        let (state, _dir) = test_state().await;
        let err = create_account(&state, &register_req("alice", "short")).unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn login_checks_password_and_ban() {
        let (state, _dir) = test_state().await;
        create_account(&state, &register_req("owner", "password1")).unwrap();
        let bob = create_account(&state, &register_req("bob", "password1")).unwrap();

        let login = |password: &str| {
            sign_in(
                &state,
                &LoginRequest {
                    username: "Bob".to_string(),
                    password: password.to_string(),
                },
            )
        };

        assert_eq!(login("password1").unwrap().user_id, bob.user_id);
        assert!(matches!(login("wrong-password"), Err(ApiError::InvalidCredentials)));

        state.db.set_banned(bob.user_id, true).unwrap();
        assert!(matches!(login("password1"), Err(ApiError::Forbidden(_))));
    }

    #[tokio::test]
    async fn unknown_user_gets_generic_error() {
        let (state, _dir) = test_state().await;
        let err = sign_in(
            &state,
            &LoginRequest {
                username: "ghost".to_string(),
                password: "whatever1".to_string(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, ApiError::InvalidCredentials));
    }
}
