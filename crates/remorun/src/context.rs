//! Shared state of one resolver: its runner catalog, its plugin chain and the
//! registry of runner environments living in this context.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use futures::future::join_all;
use serde_json::Value;

use crate::environment::RunnerEnvironmentClient;
use crate::environment::RunnerEnvironmentHost;
use crate::error::DisconnectReason;
use crate::error::Error;
use crate::error::Result;
use crate::error::collect_errors;
use crate::plugins::Cancel;
use crate::plugins::PluginsResolver;
use crate::plugins::TransferContext;
use crate::runner::LocalRunner;
use crate::runner::RunnerCatalog;
use crate::runner::RunnerToken;

/// Registry of everything a resolver owns.
///
/// Hosted environments are held strongly: they live until destroyed. Runner
/// proxies are held weakly so dropping the last `ResolvedRunner` frees its
/// bookkeeping without an explicit disconnect.
pub(crate) struct ResolverContext {
    pub(crate) catalog: RunnerCatalog,
    pub(crate) plugins: PluginsResolver,
    hosted: DashMap<u64, Arc<RunnerEnvironmentHost>>,
    clients: DashMap<u64, Weak<RunnerEnvironmentClient>>,
    next_id: AtomicU64,
}

impl ResolverContext {
    pub(crate) fn new(catalog: RunnerCatalog, plugins: PluginsResolver) -> Arc<Self> {
        Arc::new(Self {
            catalog,
            plugins,
            hosted: DashMap::new(),
            clients: DashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn track_client(&self, id: u64, client: &Arc<RunnerEnvironmentClient>) {
        self.clients.insert(id, Arc::downgrade(client));
    }

    pub(crate) fn forget_client(&self, id: u64) {
        self.clients.remove(&id);
    }

    pub(crate) fn track_host(&self, id: u64, host: Arc<RunnerEnvironmentHost>) {
        self.hosted.insert(id, host);
    }

    pub(crate) fn forget_host(&self, id: u64) {
        self.hosted.remove(&id);
    }

    pub(crate) fn hosted_count(&self) -> usize {
        self.hosted.len()
    }

    pub(crate) fn client_count(&self) -> usize {
        self.clients.iter().filter(|c| c.value().strong_count() > 0).count()
    }

    /// Force-closes every proxy, then destroys every hosted runner.
    /// Returns the errors of failed destructors.
    pub(crate) async fn destroy_all(&self, reason: DisconnectReason) -> Vec<Error> {
        let clients: Vec<Arc<RunnerEnvironmentClient>> =
            self.clients.iter().filter_map(|c| c.value().upgrade()).collect();
        self.clients.clear();
        join_all(clients.iter().map(|c| c.force_destroy(reason))).await;

        let hosts: Vec<Arc<RunnerEnvironmentHost>> = self.hosted.iter().map(|h| h.value().clone()).collect();
        self.hosted.clear();
        let results = join_all(hosts.iter().map(|h| h.force_destroy())).await;

        tracing::debug!(clients = clients.len(), hosts = hosts.len(), %reason, "resolver context cleared");
        collect_errors(results)
    }

    /// Hosts `local` for the peer on the other end of `ctx` and returns what
    /// the peer needs to attach to it.
    ///
    /// The cancel handle closes the exposure without running the runner's
    /// destructor: the instance still belongs to this side.
    pub(crate) fn expose(self: &Arc<Self>, local: &LocalRunner, ctx: &TransferContext) -> Result<(RunnerToken, Value, Cancel)> {
        let host = RunnerEnvironmentHost::new(self, local.definition().clone(), ctx.strategy.clone());
        host.init_local(local.instance())?;

        let prepared = ctx.strategy.open_connection(&ctx.channel, ctx.transfer())?;
        self.track_host(host.id(), host.clone());
        if let Err(e) = host.add_connection(prepared.channel) {
            self.forget_host(host.id());
            return Err(e);
        }
        tracing::debug!(runner = %local.definition().token(), "exposed local runner");

        let token = local.definition().token().clone();
        let cancel = Cancel::new(move || async move {
            host.skip_destructor();
            host.force_destroy().await
        });
        Ok((token, prepared.attach, cancel))
    }
}
