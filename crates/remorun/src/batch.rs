//! # All-Or-Cancel Mapping
//!
//! Maps a list of items concurrently. Either every mapping succeeds and the
//! results come back in input order, or every piece of work is undone:
//!
//! - the item that failed goes through `cancel_error`,
//! - items mapped successfully (before or after the failure) go through
//!   `cancel_mapped`,
//! - items not yet started when the failure happened go through
//!   `cancel_rest` instead of being mapped.
//!
//! The failure and every cancellation error are collected, in the order they
//! occurred, for the caller to aggregate.

use futures::future::join_all;
use parking_lot::Mutex;

use crate::error::Error;
use crate::error::Result;

#[async_trait::async_trait]
pub trait BatchMapper<T: Send + 'static, R: Send + 'static>: Send + Sync {
    async fn map(&self, index: usize, item: T) -> Result<R>;

    async fn cancel_mapped(&self, index: usize, mapped: R) -> Result<()>;

    async fn cancel_rest(&self, _index: usize, _item: T) -> Result<()> {
        Ok(())
    }

    async fn cancel_error(&self, _index: usize, _error: &Error) -> Result<()> {
        Ok(())
    }
}

struct Collector<R> {
    failed: bool,
    errors: Vec<Error>,
    kept: Vec<Option<R>>,
}

pub async fn map_all_or_cancel<T, R, M>(items: Vec<T>, mapper: &M) -> std::result::Result<Vec<R>, Vec<Error>>
where
    T: Send + 'static,
    R: Send + 'static,
    M: BatchMapper<T, R> + ?Sized,
{
    let collector = Mutex::new(Collector {
        failed: false,
        errors: Vec::new(),
        kept: items.iter().map(|_| None).collect(),
    });
    let collector = &collector;

    let work = items.into_iter().enumerate().map(|(index, item)| async move {
        let failed = collector.lock().failed;
        if failed {
            if let Err(e) = mapper.cancel_rest(index, item).await {
                collector.lock().errors.push(e);
            }
            return;
        }

        match mapper.map(index, item).await {
            Ok(mapped) => {
                let late = {
                    let mut c = collector.lock();
                    if c.failed {
                        Some(mapped)
                    } else {
                        c.kept[index] = Some(mapped);
                        None
                    }
                };
                if let Some(mapped) = late {
                    if let Err(e) = mapper.cancel_mapped(index, mapped).await {
                        collector.lock().errors.push(e);
                    }
                }
            }
            Err(error) => {
                let drained: Vec<(usize, R)> = {
                    let mut c = collector.lock();
                    c.failed = true;
                    c.kept
                        .iter_mut()
                        .enumerate()
                        .filter_map(|(i, slot)| slot.take().map(|r| (i, r)))
                        .collect()
                };

                let hook = mapper.cancel_error(index, &error).await;
                {
                    let mut c = collector.lock();
                    c.errors.push(error);
                    if let Err(e) = hook {
                        c.errors.push(e);
                    }
                }

                for (i, mapped) in drained {
                    if let Err(e) = mapper.cancel_mapped(i, mapped).await {
                        collector.lock().errors.push(e);
                    }
                }
            }
        }
    });
    join_all(work).await;

    // All work is done; nothing else borrows the collector.
    let mut c = collector.lock();
    if c.failed || !c.errors.is_empty() {
        return Err(std::mem::take(&mut c.errors));
    }
    Ok(c.kept.drain(..).flatten().collect())
}
