use kube::Resource;
use parking_lot::RwLock;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::sync::Arc;

/// Wraps an index, counting the updates applied to it by resource kind.
pub struct IndexMetrics<T> {
    inner: T,

    index_size: Family<IndexLabels, Gauge>,
    index_applies: Family<IndexLabels, Counter>,
    index_deletes: Family<IndexLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct IndexLabels {
    kind: String,
}

pub trait SizedIndex<R> {
    fn size(&self) -> usize;
}

impl<T, R> SizedIndex<R> for Arc<RwLock<T>>
where
    T: SizedIndex<R>,
{
    fn size(&self) -> usize {
        self.read().size()
    }
}

impl<T> IndexMetrics<T> {
    pub fn register(inner: T, prom: &mut Registry) -> Self {
        let index_size = Family::default();
        prom.register(
            "index_size",
            "Gauge of the number of resources in the index",
            index_size.clone(),
        );

        let index_applies = Family::default();
        prom.register(
            "index_applies",
            "Count of applies to the index",
            index_applies.clone(),
        );

        let index_deletes = Family::default();
        prom.register(
            "index_deletes",
            "Count of deletes to the index",
            index_deletes.clone(),
        );

        Self {
            inner,
            index_size,
            index_applies,
            index_deletes,
        }
    }

    pub fn shared(self) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(self))
    }

    fn observe<R: Resource<DynamicType = ()>>(&self, size: usize, applied: bool) {
        let labels = IndexLabels {
            kind: R::kind(&()).to_string(),
        };
        if applied {
            self.index_applies.get_or_create(&labels).inc();
        } else {
            self.index_deletes.get_or_create(&labels).inc();
        }
        self.index_size.get_or_create(&labels).set(size as i64);
    }
}

impl<R, T> kubert::index::IndexNamespacedResource<R> for IndexMetrics<Arc<RwLock<T>>>
where
    T: SizedIndex<R>,
    T: kubert::index::IndexNamespacedResource<R>,
    R: Resource<DynamicType = ()>,
{
    fn apply(&mut self, resource: R) {
        kubert::index::IndexNamespacedResource::apply(&mut *self.inner.write(), resource);
        self.observe::<R>(SizedIndex::<R>::size(&self.inner), true);
    }

    fn delete(&mut self, namespace: String, name: String) {
        kubert::index::IndexNamespacedResource::delete(&mut *self.inner.write(), namespace, name);
        self.observe::<R>(SizedIndex::<R>::size(&self.inner), false);
    }
}

impl<R, T> kubert::index::IndexClusterResource<R> for IndexMetrics<Arc<RwLock<T>>>
where
    T: SizedIndex<R>,
    T: kubert::index::IndexClusterResource<R>,
    R: Resource<DynamicType = ()>,
{
    fn apply(&mut self, resource: R) {
        kubert::index::IndexClusterResource::apply(&mut *self.inner.write(), resource);
        self.observe::<R>(SizedIndex::<R>::size(&self.inner), true);
    }

    fn delete(&mut self, name: String) {
        kubert::index::IndexClusterResource::delete(&mut *self.inner.write(), name);
        self.observe::<R>(SizedIndex::<R>::size(&self.inner), false);
    }
}
