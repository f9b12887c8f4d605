//! Naming server's client request handling: path resolution for direct
//! operations, namespace listing, and mediation of namespace-mutating
//! operations.

use crate::naming::registry::ServerHandle;
use crate::naming::{NamingContext, NS};
use crate::namespace::{is_within, join_path, normalize_path, split_parent};
use crate::protocol::{
    format_addr, ErrorCode, OpCode, Request, Response, ServerId,
    MAX_BUFFER_SIZE,
};

/// Handles one client request and produces its response.
pub(crate) async fn handle_request(
    ctx: &NamingContext,
    req: Request,
) -> Response {
    if let Err(e) = req.validate() {
        return Response::failure(ErrorCode::ProtocolError, e);
    }
    let path = match normalize_path(&req.path) {
        Ok(path) => path,
        Err(e) => return Response::failure(ErrorCode::InvalidPath, e),
    };

    let resp = match req.op {
        OpCode::Read | OpCode::Write | OpCode::Info => locate(ctx, &path),
        OpCode::List => list(ctx, &path),
        OpCode::Create => create(ctx, &path, req).await,
        OpCode::Delete => delete(ctx, &path, req).await,
        OpCode::Copy | OpCode::Move => transfer(ctx, &path, req).await,
        OpCode::Rename => rename(ctx, &path, req).await,
    };
    resp.truncated()
}

/// Looks up the owner of `path` in the namespace.
fn owner_of(ctx: &NamingContext, path: &str) -> Result<ServerId, Response> {
    match ctx.namespace.resolve(path) {
        Ok(Some(owner)) => Ok(owner),
        Ok(None) => Err(Response::failure(
            ErrorCode::PathNotFound,
            format!("'{}' not found", path),
        )),
        Err(e) => Err(Response::failure(ErrorCode::InvalidPath, e)),
    }
}

/// Handle of `server` if it is registered and active.
fn active_handle(
    ctx: &NamingContext,
    server: ServerId,
) -> Result<ServerHandle, Response> {
    match ctx.servers.get_by_id(server) {
        Some(handle) if handle.active => Ok(handle),
        _ => Err(Response::failure(
            ErrorCode::ServerUnavailable,
            format!("server {} unavailable", server),
        )),
    }
}

/// Resolves the storage server a client should connect to for a direct
/// operation on `path`, redirecting to a backup if the owner is down.
fn locate(ctx: &NamingContext, path: &str) -> Response {
    let owner = match owner_of(ctx, path) {
        Ok(owner) => owner,
        Err(resp) => return resp,
    };
    if let Ok(handle) = active_handle(ctx, owner) {
        return Response::success(format_addr(handle.client_addr()));
    }
    match ctx.servers.backup_for(owner) {
        Some(backup) => {
            pf_debug!(NS; "redirecting '{}' from {} to backup {}",
                          path, owner, backup.id);
            Response::redirect(backup.client_addr())
        }
        None => Response::failure(
            ErrorCode::ServerUnavailable,
            format!("server {} unavailable and no backup", owner),
        ),
    }
}

/// Renders the subtree at `path`. A rendering that does not fit in one
/// response fails instead of being cut short.
fn list(ctx: &NamingContext, path: &str) -> Response {
    match ctx.namespace.print_subtree(path) {
        Ok(Some(tree)) if tree.len() > MAX_BUFFER_SIZE => Response::failure(
            ErrorCode::CapacityExceeded,
            format!(
                "listing of '{}' is {} bytes, over the {} byte limit; \
                 list a deeper path",
                path,
                tree.len(),
                MAX_BUFFER_SIZE
            ),
        ),
        Ok(Some(tree)) => Response::success(tree),
        Ok(None) => Response::failure(
            ErrorCode::PathNotFound,
            format!("'{}' not found", path),
        ),
        Err(e) => Response::failure(ErrorCode::InvalidPath, e),
    }
}

/// Forwards `req` to `server` over its link and waits for the outcome.
async fn forward(
    ctx: &NamingContext,
    server: ServerId,
    req: Request,
) -> Response {
    let handle = match active_handle(ctx, server) {
        Ok(handle) => handle,
        Err(resp) => return resp,
    };
    match handle.forward(req).await {
        Ok(resp) => resp,
        Err(e) => {
            pf_warn!(NS; "error forwarding -> {}: {}", server, e);
            Response::failure(
                ErrorCode::ServerUnavailable,
                format!("server {} unavailable", server),
            )
        }
    }
}

/// Fails with `PathExists` if `path` is already in the namespace.
fn ensure_absent(ctx: &NamingContext, path: &str) -> Result<(), Response> {
    match ctx.namespace.contains(path) {
        Ok(false) => Ok(()),
        Ok(true) => Err(Response::failure(
            ErrorCode::PathExists,
            format!("'{}' already exists", path),
        )),
        Err(e) => Err(Response::failure(ErrorCode::InvalidPath, e)),
    }
}

/// Owner of the directory a new entry at `path` would be created in. Entries
/// at the top level go to the lowest-ID active server.
fn parent_owner(
    ctx: &NamingContext,
    path: &str,
) -> Result<ServerId, Response> {
    match split_parent(path) {
        None => Err(Response::failure(
            ErrorCode::InvalidPath,
            "the namespace root cannot be modified",
        )),
        Some(("", _)) => match ctx.servers.first_active() {
            Some(handle) => Ok(handle.id),
            None => Err(Response::failure(
                ErrorCode::ServerUnavailable,
                "no active storage server",
            )),
        },
        Some((parent, _)) => owner_of(ctx, parent),
    }
}

async fn create(ctx: &NamingContext, path: &str, req: Request) -> Response {
    let owner = match ensure_absent(ctx, path)
        .and_then(|_| parent_owner(ctx, path))
    {
        Ok(owner) => owner,
        Err(resp) => return resp,
    };

    let resp = forward(ctx, owner, req).await;
    if resp.is_success() {
        if let Err(e) = ctx.namespace.insert(path, owner) {
            pf_error!(NS; "error inserting '{}': {}", path, e);
        }
    }
    resp
}

async fn delete(ctx: &NamingContext, path: &str, req: Request) -> Response {
    if path.is_empty() {
        return Response::failure(
            ErrorCode::InvalidPath,
            "the namespace root cannot be deleted",
        );
    }
    let owner = match owner_of(ctx, path) {
        Ok(owner) => owner,
        Err(resp) => return resp,
    };

    let resp = forward(ctx, owner, req).await;
    if resp.is_success() {
        if let Err(e) = ctx.namespace.delete(path) {
            pf_error!(NS; "error deleting '{}': {}", path, e);
        }
    }
    resp
}

/// Checks that `dest` can receive the subtree at `path` owned by `owner`:
/// it must not exist, must not lie inside `path`, and its parent must live
/// on the same server.
fn check_dest(
    ctx: &NamingContext,
    path: &str,
    owner: ServerId,
    dest: &str,
) -> Result<(), Response> {
    ensure_absent(ctx, dest)?;
    if is_within(dest, path) {
        return Err(Response::failure(
            ErrorCode::InvalidOperation,
            format!("'{}' lies inside '{}'", dest, path),
        ));
    }
    match split_parent(dest) {
        None => Err(Response::failure(
            ErrorCode::InvalidPath,
            "the namespace root cannot be a destination",
        )),
        Some(("", _)) => Ok(()),
        Some((parent, _)) if owner_of(ctx, parent)? == owner => Ok(()),
        Some(_) => Err(Response::failure(
            ErrorCode::InvalidOperation,
            "source and destination live on different servers",
        )),
    }
}

/// COPY and MOVE within one storage server.
async fn transfer(ctx: &NamingContext, path: &str, req: Request) -> Response {
    let dest = match normalize_path(req.dest.as_deref().unwrap_or_default()) {
        Ok(dest) => dest,
        Err(e) => return Response::failure(ErrorCode::InvalidPath, e),
    };
    let owner = match owner_of(ctx, path)
        .and_then(|owner| check_dest(ctx, path, owner, &dest).map(|_| owner))
    {
        Ok(owner) => owner,
        Err(resp) => return resp,
    };

    let op = req.op;
    let resp = forward(ctx, owner, req).await;
    if resp.is_success() {
        let res = if op == OpCode::Copy {
            ctx.namespace.copy_subtree(path, &dest)
        } else {
            ctx.namespace.move_subtree(path, &dest)
        };
        if let Err(e) = res {
            pf_error!(NS; "error applying {:?} '{}' -> '{}': {}",
                          op, path, dest, e);
        }
    }
    resp
}

/// RENAME gives the entry a new name inside the same directory. The request
/// is forwarded with its destination expanded to the full new path.
async fn rename(
    ctx: &NamingContext,
    path: &str,
    mut req: Request,
) -> Response {
    let name = req.dest.as_deref().unwrap_or_default();
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Response::failure(
            ErrorCode::InvalidPath,
            format!("invalid new name '{}'", name),
        );
    }
    let dest = match split_parent(path) {
        Some((parent, _)) => join_path(parent, name),
        None => {
            return Response::failure(
                ErrorCode::InvalidPath,
                "the namespace root cannot be renamed",
            )
        }
    };
    let owner = match owner_of(ctx, path)
        .and_then(|owner| check_dest(ctx, path, owner, &dest).map(|_| owner))
    {
        Ok(owner) => owner,
        Err(resp) => return resp,
    };

    req.dest = Some(dest.clone());
    let resp = forward(ctx, owner, req).await;
    if resp.is_success() {
        if let Err(e) = ctx.namespace.move_subtree(path, &dest) {
            pf_error!(NS; "error renaming '{}' -> '{}': {}", path, dest, e);
        }
    }
    resp
}

#[cfg(test)]
mod handler_tests {
    use super::*;
    use crate::naming::{ClientRegistry, Namespace, ServerRegistry};

    fn context() -> NamingContext {
        NamingContext {
            namespace: Namespace::new(16),
            servers: ServerRegistry::new(0, 4),
            clients: ClientRegistry::new(4),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oversized_listing_fails() -> Result<(), crate::utils::NetFsError> {
        let ctx = context();
        for i in 0..200 {
            ctx.namespace.insert(&format!("/docs/entry-{:03}.txt", i), 0)?;
        }
        ctx.namespace.insert("/small/a.txt", 0)?;

        let req = Request::new(OpCode::List, 1, "/docs");
        let resp = handle_request(&ctx, req).await;
        assert!(!resp.is_success());
        assert_eq!(resp.error_code, ErrorCode::CapacityExceeded);
        assert!(resp.validate().is_ok());

        let req = Request::new(OpCode::List, 1, "/small");
        let resp = handle_request(&ctx, req).await;
        assert!(resp.is_success(), "{:?}", resp);
        assert!(resp.data.contains("a.txt"));
        Ok(())
    }
}
