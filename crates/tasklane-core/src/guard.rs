use crate::session::SessionSnapshot;

pub const LOGIN_PATH: &str = "/login";
pub const LANDING_PATH: &str = "/tasks";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAccess {
    /// Requires a signed-in user.
    Protected,
    /// Only for signed-out users (login, register).
    PublicOnly,
    Open,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Loading,
    Render,
    Redirect(String),
}

#[derive(Debug, Clone, Copy)]
pub struct GuardInput<'a> {
    pub is_authenticated: bool,
    pub is_loading: bool,
    pub require_auth: bool,
    pub fallback_path: Option<&'a str>,
    pub current_path: &'a str,
}

/// Decides what a guarded route shows. Pure; never redirects while the
/// session is still loading and never redirects to the current path.
pub fn evaluate(input: GuardInput<'_>) -> GuardDecision {
    if input.is_loading {
        return GuardDecision::Loading;
    }

    let target = if input.require_auth && !input.is_authenticated {
        let fallback = input
            .fallback_path
            .filter(|path| !path.trim().is_empty())
            .unwrap_or(LOGIN_PATH);
        Some(with_callback(fallback, input.current_path))
    } else if !input.require_auth
        && input.is_authenticated
        && route_access(input.current_path) == RouteAccess::PublicOnly
    {
        Some(LANDING_PATH.to_string())
    } else {
        None
    };

    match target {
        Some(target) if path_only(&target) != path_only(input.current_path) => {
            GuardDecision::Redirect(target)
        }
        _ => GuardDecision::Render,
    }
}

/// Evaluates `path` against the route table for the given session.
pub fn evaluate_route(session: &SessionSnapshot, path: &str) -> GuardDecision {
    evaluate(GuardInput {
        is_authenticated: session.is_authenticated(),
        is_loading: session.is_loading,
        require_auth: route_access(path) == RouteAccess::Protected,
        fallback_path: None,
        current_path: path,
    })
}

pub fn route_access(path: &str) -> RouteAccess {
    let path = path_only(path);
    let under = |root: &str| {
        path == root
            || path
                .strip_prefix(root)
                .is_some_and(|rest| rest.starts_with('/'))
    };

    if under("/tasks") || under("/chat") || under("/profile") {
        RouteAccess::Protected
    } else if under(LOGIN_PATH) || under("/register") {
        RouteAccess::PublicOnly
    } else {
        RouteAccess::Open
    }
}

/// Where `/` sends the user once the session has resolved.
pub fn home_redirect(session: &SessionSnapshot) -> Option<&'static str> {
    if session.is_loading {
        None
    } else if session.is_authenticated() {
        Some(LANDING_PATH)
    } else {
        Some(LOGIN_PATH)
    }
}

/// Reads the `callbackUrl` parameter back out of a login redirect.
pub fn callback_target(path: &str) -> Option<String> {
    let (_, query) = path.split_once('?')?;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "callbackUrl")
        .and_then(|(_, value)| urlencoding::decode(value).ok())
        .map(|value| value.into_owned())
}

fn with_callback(fallback: &str, requested: &str) -> String {
    let separator = if fallback.contains('?') { '&' } else { '?' };
    format!(
        "{fallback}{separator}callbackUrl={}",
        urlencoding::encode(requested)
    )
}

fn path_only(path: &str) -> &str {
    path.split(['?', '#']).next().unwrap_or(path)
}
