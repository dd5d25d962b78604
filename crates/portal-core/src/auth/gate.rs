//! Password-change gate and route guard.
//!
//! A session flagged with `force_password_change` is `Gated`: the only
//! reachable routes are the gate itself and sign-out until the password
//! change succeeds.

use crate::models::{Identity, Role};

use super::Session;

/// Sign-in entry point
pub const SIGN_IN_ROUTE: &str = "/login";

/// Password-change gate
pub const PASSWORD_GATE_ROUTE: &str = "/change-password";

pub const SIGN_OUT_ROUTE: &str = "/logout";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    SignedOut,
    Normal,
    Gated,
}

impl GateState {
    pub fn of(session: &Session) -> Self {
        if !session.is_authenticated() {
            GateState::SignedOut
        } else if session.force_password_change() {
            GateState::Gated
        } else {
            GateState::Normal
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Allow,
    Redirect(&'static str),
}

/// Decide whether `route` may be shown for the given gate state
pub fn guard(state: GateState, identity: Option<&Identity>, route: &str) -> RouteDecision {
    let path = normalize(route);

    match state {
        GateState::SignedOut => {
            if path == SIGN_IN_ROUTE {
                RouteDecision::Allow
            } else {
                RouteDecision::Redirect(SIGN_IN_ROUTE)
            }
        }
        GateState::Gated => {
            if path == PASSWORD_GATE_ROUTE || path == SIGN_OUT_ROUTE {
                RouteDecision::Allow
            } else {
                RouteDecision::Redirect(PASSWORD_GATE_ROUTE)
            }
        }
        GateState::Normal => {
            let Some(identity) = identity else {
                return RouteDecision::Redirect(SIGN_IN_ROUTE);
            };
            let home = identity.role.home_route();

            if path == SIGN_IN_ROUTE || path == PASSWORD_GATE_ROUTE {
                return RouteDecision::Redirect(home);
            }
            match area_role(path) {
                Some(role) if role != identity.role => RouteDecision::Redirect(home),
                _ => RouteDecision::Allow,
            }
        }
    }
}

/// Strip query string, fragment and trailing slash
fn normalize(route: &str) -> &str {
    let end = route.find(|c: char| c == '?' || c == '#').unwrap_or(route.len());
    let path = &route[..end];
    if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    }
}

/// Which role owns the area a path belongs to, if any
fn area_role(path: &str) -> Option<Role> {
    [Role::Admin, Role::Client, Role::Investor]
        .into_iter()
        .find(|role| {
            let home = role.home_route();
            path == home
                || path
                    .strip_prefix(home)
                    .is_some_and(|rest| rest.starts_with('/'))
        })
}
