//! IngressRoute reconciliation and `Host(...)` rule parsing

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::view::IngressRouteView;
use super::watch::{Change, ChangeHandler};
use super::Controller;
use crate::crd::IngressRoute;

const HOST_MATCHER: &str = "Host(";

/// Extract the hostnames of every `Host(...)` clause in a route match rule.
///
/// Arguments are backtick- or double-quote-delimited and comma-separated.
/// A clause with malformed quoting contributes nothing; other clauses in the
/// same rule still count. How clauses are combined (`&&`, `||`) is irrelevant.
pub fn parse_host_rule(rule: &str) -> Vec<String> {
    let mut domains = Vec::new();
    let mut rest = rule;

    while let Some(start) = rest.find(HOST_MATCHER) {
        let preceded_by_ident = rest[..start]
            .chars()
            .next_back()
            .map(|c| c.is_alphanumeric() || c == '_')
            .unwrap_or(false);

        let args_and_tail = &rest[start + HOST_MATCHER.len()..];
        let Some(end) = args_and_tail.find(')') else {
            break;
        };

        if !preceded_by_ident {
            if let Some(hosts) = parse_host_args(&args_and_tail[..end]) {
                domains.extend(hosts);
            }
        }
        rest = &args_and_tail[end + 1..];
    }

    domains
}

fn parse_host_args(args: &str) -> Option<Vec<String>> {
    args.split(',')
        .map(|arg| {
            let arg = arg.trim();
            let quote = arg.chars().next().filter(|c| *c == '`' || *c == '"')?;
            let inner = arg.strip_prefix(quote)?.strip_suffix(quote)?;
            if inner.is_empty() || inner.contains(quote) {
                return None;
            }
            Some(inner.to_string())
        })
        .collect()
}

impl Controller {
    /// Request a certificate for the TLS entry of an opted-in IngressRoute
    #[instrument(skip_all, fields(namespace = %route.meta.namespace, route = %route.meta.name))]
    pub fn sync_ingress_route(&self, route: &IngressRouteView) {
        if !route.meta.is_opted_in() {
            return;
        }
        let Some(block) = &route.tls else {
            return;
        };

        debug!(domains = ?block.domains, secret = %block.secret_name, "Syncing route TLS");
        self.sync_tls_block(&route.meta.namespace, block);
    }

    /// Handle an IngressRoute change
    pub async fn on_ingress_route_change(&self, change: Change<IngressRouteView>) {
        self.reconcile_change(change, Self::sync_ingress_route).await;
    }
}

#[async_trait]
impl ChangeHandler<IngressRoute> for Controller {
    async fn handle(&self, change: Change<Arc<IngressRoute>>) {
        self.on_ingress_route_change(change.map(|r| IngressRouteView::from(r.as_ref())))
            .await;
    }
}
