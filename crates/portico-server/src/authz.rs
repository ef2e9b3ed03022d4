use crate::http_server::AppState;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use portico_acl::{AuthnIdentity, AuthzStatus, Principal};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use std::collections::HashMap;
use std::net::SocketAddr;

/// The batch authorization request: an identity plus the resource
/// URLs the appliance wants verdicts for.
#[derive(Debug, PartialEq, Eq)]
pub struct AuthzRequest {
    pub user: Principal,
    pub groups: Vec<Principal>,
    pub resources: Vec<String>,
}

fn status_name(status: AuthzStatus) -> &'static str {
    match status {
        AuthzStatus::Permit => "PERMIT",
        AuthzStatus::Deny => "DENY",
        AuthzStatus::Indeterminate => "INDETERMINATE",
    }
}

/// `POST /authz`: decode each resource, ask the repository's
/// authorizer, answer one decision per resource. Resources that do
/// not decode, and everything when the repository has no authorizer,
/// come back INDETERMINATE so the appliance can fall back to its own
/// checks.
pub async fn handle_authz(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: String,
) -> Response {
    if !state.trusted.is_trusted(peer.ip()) {
        return (StatusCode::FORBIDDEN, "only the appliance may ask").into_response();
    }
    let request = match parse_authz_request(&body) {
        Ok(request) => request,
        Err(err) => {
            tracing::debug!("unparseable authz request: {err}");
            return (StatusCode::BAD_REQUEST, format!("bad request: {err}")).into_response();
        }
    };
    let identity = AuthnIdentity::with_groups(request.user, request.groups);
    let mut decoded = Vec::new();
    for resource in &request.resources {
        match state.codec.decode(resource) {
            Ok(doc_id) => decoded.push((resource.clone(), Some(doc_id))),
            Err(err) => {
                tracing::debug!("authz resource {resource:?} does not decode: {err}");
                decoded.push((resource.clone(), None));
            }
        }
    }
    let ids: Vec<portico_docid::DocId> = decoded
        .iter()
        .filter_map(|(_, id)| id.clone())
        .collect();
    let verdicts = match state.repo.authorizer() {
        Some(authorizer) if !ids.is_empty() => {
            match authorizer.is_authorized(&identity, &ids).await {
                Ok(verdicts) => verdicts,
                Err(err) => {
                    tracing::warn!("batch authorization failed: {err:#}");
                    HashMap::new()
                }
            }
        }
        _ => HashMap::new(),
    };
    let mut lines = Vec::with_capacity(decoded.len());
    for (resource, doc_id) in decoded {
        let status = doc_id
            .and_then(|id| verdicts.get(&id).copied())
            .unwrap_or(AuthzStatus::Indeterminate);
        lines.push((resource, status));
    }
    match render_authz_response(&lines) {
        Ok(xml) => ([(header::CONTENT_TYPE, "text/xml")], xml).into_response(),
        Err(err) => {
            tracing::error!("cannot render authz response: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

pub fn parse_authz_request(xml: &str) -> anyhow::Result<AuthzRequest> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut user: Option<Principal> = None;
    let mut groups = Vec::new();
    let mut resources = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    let mut namespace = portico_acl::DEFAULT_NAMESPACE.to_string();
    let mut text = String::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if name == "user" || name == "group" {
                    namespace = portico_acl::DEFAULT_NAMESPACE.to_string();
                    for attr in e.attributes() {
                        let attr = attr?;
                        if attr.key.as_ref() == b"namespace" {
                            namespace = attr.unescape_value()?.to_string();
                        }
                    }
                    text.clear();
                }
                stack.push(name);
            }
            Event::Empty(e) => {
                if e.name().as_ref() == b"resource" {
                    for attr in e.attributes() {
                        let attr = attr?;
                        if attr.key.as_ref() == b"url" {
                            resources.push(attr.unescape_value()?.to_string());
                        }
                    }
                }
            }
            Event::Text(e) => {
                text.push_str(&e.unescape()?);
            }
            Event::End(e) => {
                stack.pop();
                match e.name().as_ref() {
                    b"user" => {
                        user = Some(Principal::user_in_namespace(
                            text.clone(),
                            namespace.clone(),
                        ))
                    }
                    b"group" => groups.push(Principal::group_in_namespace(
                        text.clone(),
                        namespace.clone(),
                    )),
                    _ => {}
                }
                text.clear();
            }
            Event::Eof => break,
            _ => {}
        }
    }
    let user = user.ok_or_else(|| anyhow::anyhow!("request names no user"))?;
    Ok(AuthzRequest {
        user,
        groups,
        resources,
    })
}

fn render_authz_response(lines: &[(String, AuthzStatus)]) -> anyhow::Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    if lines.is_empty() {
        writer.write_event(Event::Empty(BytesStart::new("authz-response")))?;
    } else {
        writer.write_event(Event::Start(BytesStart::new("authz-response")))?;
        for (resource, status) in lines {
            let mut decision = BytesStart::new("decision");
            decision.push_attribute(("url", resource.as_str()));
            decision.push_attribute(("result", status_name(*status)));
            writer.write_event(Event::Empty(decision))?;
        }
        writer.write_event(Event::End(BytesEnd::new("authz-response")))?;
    }
    let mut bytes = writer.into_inner();
    bytes.push(b'\n');
    Ok(String::from_utf8(bytes)?)
}
