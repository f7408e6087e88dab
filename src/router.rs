//! Radix-tree request router.
//!
//! One [`matchit`] tree maps path patterns to nodes; each node maps methods
//! to a composed chain. The router is itself a middleware: mount it with
//! [`App::use_handler`](crate::App::use_handler).
//!
//! Per request:
//!
//! 1. a path outside the router's root passes through untouched,
//! 2. no node: redirect to a corrected path if one matches (301 for
//!    `GET`/`HEAD`, 307 otherwise), else run `otherwise`, else 501,
//! 3. node without the method: `OPTIONS` gets 204 with `Allow`, else run
//!    `otherwise`, else 405 with `Allow`,
//! 4. otherwise the path parameters are stored on the context and the
//!    route's chain runs.
//!
//! `HEAD` falls back to the `GET` chain; the response drops the body.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use http::Method;
use http::header::ALLOW;
use matchit::Router as MatchitRouter;

use crate::context::{Context, Key};
use crate::error::Error;
use crate::handler::{BoxFuture, Handler, Middleware, Outcome};
use crate::middleware::compose;

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct RouterOptions {
    /// Prefix every pattern is relative to. Requests outside it pass through.
    pub root: String,
    /// Redirect to the cleaned (`//`, `.`, `..`) or lowercased path when that
    /// one matches.
    pub fixed_path_redirect: bool,
    /// Redirect `/a/` to `/a` or the reverse when only the other is routed.
    pub trailing_slash_redirect: bool,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            root: "/".to_owned(),
            fixed_path_redirect: true,
            trailing_slash_redirect: true,
        }
    }
}

// ── Params ───────────────────────────────────────────────────────────────────

/// Path parameters of the matched route, in pattern order.
#[derive(Clone, Debug, Default)]
pub struct Params(Arc<[(String, String)]>);

impl Params {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Capability key the router stores matched parameters under.
pub(crate) struct RouteParams;

impl Key for RouteParams {
    type Value = Params;
}

// ── Router ───────────────────────────────────────────────────────────────────

/// The application router.
///
/// Patterns accept `:name` and `*name` segments as well as matchit's own
/// `{name}` and `{*name}`. Each builder call returns `self`:
///
/// ```rust
/// # use cog::{Context, Outcome, Router};
/// # async fn get_user(_: Context) -> Outcome { Ok(()) }
/// # async fn create_user(_: Context) -> Outcome { Ok(()) }
/// # async fn delete_user(_: Context) -> Outcome { Ok(()) }
/// Router::new()
///     .delete("/users/:id", delete_user)
///     .get("/users/:id",    get_user)
///     .post("/users",       create_user);
/// ```
pub struct Router {
    options: RouterOptions,
    /// `root` without its trailing slash.
    prefix: String,
    tree: MatchitRouter<usize>,
    nodes: Vec<Node>,
    patterns: HashMap<String, usize>,
    with: Vec<Middleware>,
    before: Option<Middleware>,
    otherwise: Option<Middleware>,
}

struct Node {
    pattern: String,
    methods: Vec<(Method, Middleware)>,
}

impl Node {
    fn handler(&self, method: &Method) -> Option<&Middleware> {
        match self.handler_exact(method) {
            None if *method == Method::HEAD => self.handler_exact(&Method::GET),
            found => found,
        }
    }

    fn allow(&self) -> String {
        let mut allow: Vec<&str> = Vec::with_capacity(self.methods.len() + 1);
        for (method, _) in &self.methods {
            allow.push(method.as_str());
            if *method == Method::GET && self.handler_exact(&Method::HEAD).is_none() {
                allow.push(Method::HEAD.as_str());
            }
        }
        allow.join(", ")
    }

    fn handler_exact(&self, method: &Method) -> Option<&Middleware> {
        self.methods.iter().find(|(k, _)| k == method).map(|(_, h)| h)
    }
}

enum Resolved {
    Pass,
    Done(Outcome),
    Run(Middleware),
}

impl Router {
    pub fn new() -> Self {
        Self::with_options(RouterOptions::default())
    }

    pub fn with_options(mut options: RouterOptions) -> Self {
        if !options.root.ends_with('/') {
            options.root.push('/');
        }
        let prefix = options.root[..options.root.len() - 1].to_owned();
        Self {
            options,
            prefix,
            tree: MatchitRouter::new(),
            nodes: Vec::new(),
            patterns: HashMap::new(),
            with: Vec::new(),
            before: None,
            otherwise: None,
        }
    }

    /// Registers `chain` for `method` on `pattern`.
    ///
    /// # Panics
    ///
    /// Panics if `chain` is empty, the pattern is invalid or conflicts with
    /// another, or `method` is already routed on this pattern.
    pub fn handle(mut self, method: Method, pattern: &str, chain: Vec<Middleware>) -> Self {
        if chain.is_empty() {
            panic!("route {method} {pattern} has no handlers");
        }
        let converted = convert(pattern);
        let index = match self.patterns.get(&converted) {
            Some(&index) => index,
            None => {
                let index = self.nodes.len();
                self.tree
                    .insert(converted.clone(), index)
                    .unwrap_or_else(|e| panic!("invalid route `{pattern}`: {e}"));
                self.nodes.push(Node { pattern: pattern.to_owned(), methods: Vec::new() });
                self.patterns.insert(converted, index);
                index
            }
        };
        let node = &mut self.nodes[index];
        if node.handler_exact(&method).is_some() {
            panic!("route {method} {} is already defined", node.pattern);
        }
        node.methods.push((method, compose(chain)));
        self
    }

    pub fn on(self, method: Method, pattern: &str, handler: impl Handler) -> Self {
        self.handle(method, pattern, vec![Middleware::new(handler)])
    }

    pub fn get(self, pattern: &str, handler: impl Handler) -> Self {
        self.on(Method::GET, pattern, handler)
    }

    pub fn head(self, pattern: &str, handler: impl Handler) -> Self {
        self.on(Method::HEAD, pattern, handler)
    }

    pub fn post(self, pattern: &str, handler: impl Handler) -> Self {
        self.on(Method::POST, pattern, handler)
    }

    pub fn put(self, pattern: &str, handler: impl Handler) -> Self {
        self.on(Method::PUT, pattern, handler)
    }

    pub fn patch(self, pattern: &str, handler: impl Handler) -> Self {
        self.on(Method::PATCH, pattern, handler)
    }

    pub fn delete(self, pattern: &str, handler: impl Handler) -> Self {
        self.on(Method::DELETE, pattern, handler)
    }

    pub fn options(self, pattern: &str, handler: impl Handler) -> Self {
        self.on(Method::OPTIONS, pattern, handler)
    }

    /// Runs for unmatched paths and methods instead of the 501/405 errors.
    pub fn otherwise(mut self, handler: impl Handler) -> Self {
        self.otherwise = Some(Middleware::new(handler));
        self
    }

    /// Router-level middleware, run before the matched route or `otherwise`.
    pub fn with(mut self, handler: impl Handler) -> Self {
        self.with.push(Middleware::new(handler));
        self.before = Some(compose(self.with.clone()));
        self
    }

    fn resolve(&self, ctx: &Context) -> Resolved {
        let full = ctx.path();
        let path = if full == self.prefix {
            "/"
        } else {
            match full.strip_prefix(self.options.root.as_str()) {
                Some(_) => &full[self.prefix.len()..],
                None => return Resolved::Pass,
            }
        };

        let Ok(matched) = self.tree.at(path) else {
            if let Some(fixed) = self.suggest(path) {
                return Resolved::Done(self.redirect(ctx, &fixed));
            }
            return match &self.otherwise {
                Some(otherwise) => Resolved::Run(otherwise.clone()),
                None => Resolved::Done(Err(Error::NOT_IMPLEMENTED
                    .with_message(format!("{full:?} is not implemented"))
                    .into())),
            };
        };

        let node = &self.nodes[*matched.value];
        let method = ctx.method();
        match node.handler(method) {
            Some(handler) => {
                let params: Vec<(String, String)> = matched
                    .params
                    .iter()
                    .map(|(k, v)| (k.to_owned(), v.to_owned()))
                    .collect();
                ctx.set_any(&RouteParams, Params(params.into()));
                Resolved::Run(handler.clone())
            }
            None if *method == Method::OPTIONS => {
                ctx.response().set_header(ALLOW, node.allow());
                Resolved::Done(ctx.end(204, "").map_err(Into::into))
            }
            None => match &self.otherwise {
                Some(otherwise) => Resolved::Run(otherwise.clone()),
                None => {
                    ctx.response().set_header(ALLOW, node.allow());
                    Resolved::Done(Err(Error::METHOD_NOT_ALLOWED
                        .with_message(format!("{method} is not allowed in {full:?}"))
                        .into()))
                }
            },
        }
    }

    /// A routed path close to `path`, if redirects are enabled.
    fn suggest(&self, path: &str) -> Option<String> {
        let routed = |p: &str| self.tree.at(p).is_ok();
        if self.options.trailing_slash_redirect {
            if let Some(alt) = toggle_slash(path) {
                if routed(&alt) {
                    return Some(alt);
                }
            }
        }
        if self.options.fixed_path_redirect {
            let cleaned = clean_path(path);
            let lower = cleaned.to_lowercase();
            for candidate in [cleaned, lower] {
                if candidate != path && routed(&candidate) {
                    return Some(candidate);
                }
                if self.options.trailing_slash_redirect {
                    if let Some(alt) = toggle_slash(&candidate) {
                        if routed(&alt) {
                            return Some(alt);
                        }
                    }
                }
            }
        }
        None
    }

    fn redirect(&self, ctx: &Context, path: &str) -> Outcome {
        let mut location = format!("{}{path}", self.prefix);
        if let Some(query) = ctx.uri().query() {
            location.push('?');
            location.push_str(query);
        }
        let code = if matches!(*ctx.method(), Method::GET | Method::HEAD) { 301 } else { 307 };
        ctx.set_status(code);
        ctx.redirect(&location)?;
        Ok(())
    }
}

impl Handler for Router {
    fn call(&self, ctx: Context) -> BoxFuture {
        match self.resolve(&ctx) {
            Resolved::Pass => Box::pin(async { Ok(()) }),
            Resolved::Done(outcome) => Box::pin(async move { outcome }),
            Resolved::Run(handler) => {
                let before = self.before.clone();
                Box::pin(async move {
                    if let Some(before) = before {
                        before.call(ctx.clone()).await?;
                        if ctx.response().ended() {
                            return Ok(());
                        }
                    }
                    handler.call(ctx).await
                })
            }
        }
    }
}

impl Default for Router {
    fn default() -> Self { Self::new() }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let routes: Vec<String> = self
            .nodes
            .iter()
            .map(|n| format!("{} {}", n.allow(), n.pattern))
            .collect();
        f.debug_struct("Router")
            .field("root", &self.options.root)
            .field("routes", &routes)
            .finish()
    }
}

// ── Path helpers ─────────────────────────────────────────────────────────────

/// `:id` becomes `{id}` and `*rest` becomes `{*rest}`.
fn convert(pattern: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    for segment in pattern.split('/') {
        let segment = if let Some(name) = segment.strip_prefix(':') {
            format!("{{{name}}}")
        } else if let Some(name) = segment.strip_prefix('*') {
            format!("{{*{name}}}")
        } else {
            segment.to_owned()
        };
        out.push(segment);
    }
    let joined = out.join("/");
    if joined.starts_with('/') { joined } else { format!("/{joined}") }
}

fn toggle_slash(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    Some(match path.strip_suffix('/') {
        Some(trimmed) => trimmed.to_owned(),
        None => format!("{path}/"),
    })
}

/// Lexical cleanup: collapses `//`, drops `.`, resolves `..`. A trailing
/// slash survives.
fn clean_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    let mut cleaned = format!("/{}", segments.join("/"));
    if path.ends_with('/') && cleaned.len() > 1 {
        cleaned.push('/');
    }
    cleaned
}
