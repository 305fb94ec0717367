//! CSRF token issuance

use axum::{extract::State, Json};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::Serialize;

use crate::csrf::{CSRF_COOKIE, CSRF_FORM_FIELD, CSRF_HEADER};
use crate::state::AppState;

#[derive(Serialize)]
pub struct CsrfTokenResponse {
    pub csrf_token: String,
    pub form_field: &'static str,
    pub header: &'static str,
    pub expires_in: i64,
}

/// Issue a token pair: the form token in the body, the cookie token as a cookie
pub async fn issue_token(
    State(state): State<AppState>,
    jar: CookieJar,
) -> (CookieJar, Json<CsrfTokenResponse>) {
    let pair = state.csrf().issue();

    let cookie = Cookie::build((CSRF_COOKIE, pair.cookie_token))
        .path("/")
        .http_only(true)
        .secure(true)
        .same_site(SameSite::Strict);

    (
        jar.add(cookie),
        Json(CsrfTokenResponse {
            csrf_token: pair.form_token,
            form_field: CSRF_FORM_FIELD,
            header: CSRF_HEADER,
            expires_in: state.csrf().expiration_secs(),
        }),
    )
}
