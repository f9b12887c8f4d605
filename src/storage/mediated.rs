//! Namespace-mutating operations forwarded by the naming server.

use std::sync::Arc;

use crate::namespace::split_parent;
use crate::protocol::{ErrorCode, OpCode, Request, Response, FLAG_DIRECTORY};
use crate::storage::filestore::{
    is_replica_path, normalize, OpError, OpResult,
};
use crate::storage::{FairRwLock, StorageContext, WriteGuard};

/// Takes write locks on every entry of `locks`, in the given order.
async fn write_all(
    locks: &[(String, Arc<FairRwLock>)],
) -> OpResult<Vec<WriteGuard<'_>>> {
    let mut guards = Vec::with_capacity(locks.len());
    for (_, lock) in locks {
        guards.push(lock.acquire_write().await?);
    }
    Ok(guards)
}

async fn create(ctx: &StorageContext, req: &Request) -> OpResult<Response> {
    let path = normalize(&req.path)?;
    let dir = req.has_flag(FLAG_DIRECTORY);

    // the parent's write lock keeps it from vanishing meanwhile
    let parent_lock = match split_parent(&path) {
        Some((parent, _)) if !parent.is_empty() => {
            Some(ctx.store.lock_of(parent)?)
        }
        _ => None,
    };
    {
        let _guard = match &parent_lock {
            Some(lock) => Some(lock.acquire_write().await?),
            None => None,
        };
        ctx.store.create(&path, dir).await?;
    }

    if dir {
        ctx.replicator.push_dir(&path).await;
    } else {
        ctx.replicator.push_file(&ctx.store, &path).await;
    }
    Ok(Response::success(""))
}

async fn delete(ctx: &StorageContext, req: &Request) -> OpResult<Response> {
    let path = normalize(&req.path)?;
    let locks = ctx.store.locks_under(&path);
    if locks.is_empty() {
        return Err(OpError::not_found(&path));
    }
    {
        let _guards = write_all(&locks).await?;
        ctx.store.delete(&path).await?;
    }

    ctx.replicator.push_delete(&path).await;
    Ok(Response::success(""))
}

async fn copy(ctx: &StorageContext, req: &Request) -> OpResult<Response> {
    let from = normalize(&req.path)?;
    let to = normalize(req.dest.as_deref().unwrap_or_default())?;
    let locks = ctx.store.locks_under(&from);
    if locks.is_empty() {
        return Err(OpError::not_found(&from));
    }
    {
        let mut guards = Vec::with_capacity(locks.len());
        for (_, lock) in &locks {
            guards.push(lock.acquire_read().await?);
        }
        ctx.store.copy(&from, &to).await?;
    }

    ctx.replicator.push_subtree(&ctx.store, &to).await;
    Ok(Response::success(""))
}

/// MOVE and RENAME: both arrive with the full destination path.
async fn relocate(ctx: &StorageContext, req: &Request) -> OpResult<Response> {
    let from = normalize(&req.path)?;
    let to = normalize(req.dest.as_deref().unwrap_or_default())?;
    let locks = ctx.store.locks_under(&from);
    if locks.is_empty() {
        return Err(OpError::not_found(&from));
    }
    {
        let _guards = write_all(&locks).await?;
        ctx.store.rename(&from, &to).await?;
    }

    ctx.replicator.push_delete(&from).await;
    ctx.replicator.push_subtree(&ctx.store, &to).await;
    Ok(Response::success(""))
}

/// Performs one request forwarded over the naming server link.
pub(crate) async fn handle_forwarded(
    ctx: &StorageContext,
    req: Request,
) -> Response {
    if let Err(e) = req.validate() {
        return Response::failure(ErrorCode::ProtocolError, e);
    }
    let touches_replicas = [Some(req.path.as_str()), req.dest.as_deref()]
        .into_iter()
        .flatten()
        .any(|path| normalize(path).is_ok_and(|norm| is_replica_path(&norm)));
    if touches_replicas {
        return Response::failure(
            ErrorCode::InvalidOperation,
            "the replica area is not part of the namespace",
        );
    }
    let result = match req.op {
        OpCode::Create => create(ctx, &req).await,
        OpCode::Delete => delete(ctx, &req).await,
        OpCode::Copy => copy(ctx, &req).await,
        OpCode::Move | OpCode::Rename => relocate(ctx, &req).await,
        op => Err(OpError::new(
            ErrorCode::InvalidOperation,
            format!("{:?} is not forwarded", op),
        )),
    };
    match result {
        Ok(resp) => resp,
        Err(e) => {
            pf_debug!(ctx.me; "forwarded {:?} '{}' failed: {} {}",
                              req.op, req.path, e.code, e.reason);
            e.into()
        }
    }
}
