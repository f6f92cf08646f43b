use utoipa::openapi::{Contact, InfoBuilder, License, OpenApiBuilder, Tag};
use utoipa::OpenApi;

use super::handlers::{grants, health, login, password, register, token};

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        login::login,
        register::registration_context,
        register::register_request,
        register::register,
        token::token,
        token::admin_token,
        password::change,
        password::forgot,
        grants::grant,
        grants::revoke,
        grants::list,
        grants::registration_link,
    ),
    components(schemas(
        health::Health,
        login::LoginRequest,
        login::LoginOk,
        register::RegistrationContext,
        register::RegisterRequest,
        register::RegisterFinish,
        token::TokenExchange,
        token::TokenResponse,
        token::AdminLogin,
        password::PasswordChange,
        password::ForgotPassword,
        grants::GrantRequest,
        grants::RevokeRequest,
        grants::RegistrationLinkRequest,
        crate::auth::permissions::PermissionGrant,
    ))
)]
struct ApiDoc;

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    info.contact = cargo_contact();
    info.license = cargo_license();

    let mut auth_tag = Tag::new("auth");
    auth_tag.description = Some("Login, token exchange, and passwords".to_string());
    let mut register_tag = Tag::new("register");
    register_tag.description = Some("Account registration hand-off".to_string());
    let mut admin_tag = Tag::new("admin");
    admin_tag.description = Some("Grant management and admin tokens".to_string());

    let mut doc = OpenApiBuilder::from(ApiDoc::openapi()).info(info).build();
    doc.tags = Some(vec![auth_tag, register_tag, admin_tag]);
    doc
}

fn cargo_contact() -> Option<Contact> {
    // Cargo authors are `;` separated and may include "Name <email>".
    let authors = env!("CARGO_PKG_AUTHORS");
    let primary = authors.split(';').next().map(str::trim)?;
    if primary.is_empty() {
        return None;
    }

    let (name, email) = parse_author(primary);
    if name.is_none() && email.is_none() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = name.map(str::to_string);
    contact.email = email.map(str::to_string);
    Some(contact)
}

fn cargo_license() -> Option<License> {
    let identifier = optional_str(env!("CARGO_PKG_LICENSE"))?;
    let mut license = License::new(identifier);
    license.identifier = Some(identifier.to_string());
    Some(license)
}

fn optional_str(value: &'static str) -> Option<&'static str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn parse_author(author: &str) -> (Option<&str>, Option<&str>) {
    if let Some(start) = author.find('<') {
        let name = author[..start].trim();
        let email = author[start + 1..].trim_end_matches('>').trim();
        let name = if name.is_empty() { None } else { Some(name) };
        let email = if email.is_empty() { None } else { Some(email) };
        (name, email)
    } else {
        let name = author.trim();
        (if name.is_empty() { None } else { Some(name) }, None)
    }
}
