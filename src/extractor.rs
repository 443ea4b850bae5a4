//! The capability interface between the engine and feature extractor
//! backends.
//!
//! The engine never parses binaries or traces itself; a backend (static
//! disassembler, replayed sandbox trace) exposes scope instances and streams
//! `(Feature, Location)` pairs for each one. The evaluator depends only on
//! this trait, so rules behave identically regardless of which backend
//! produced the features.

use crate::error::Result;
use crate::features::{Feature, Location};
use crate::scopes::{Scope, ScopeAxis};

/// One concrete scope instance: a function, a basic block, a thread, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceHandle {
    pub scope: Scope,
    pub location: Location,
}

impl InstanceHandle {
    pub fn new(scope: Scope, location: Location) -> Self {
        Self { scope, location }
    }
}

/// A backend that can enumerate scope instances and stream their features.
///
/// Implementations must be `Send + Sync`: independent instances are
/// evaluated on worker threads. Enumeration must be deterministic for a
/// fixed input; the engine relies on that for reproducible reports.
pub trait FeatureExtractor: Send + Sync {
    /// Which scope axis this backend populates.
    fn axis(&self) -> ScopeAxis;

    /// Features observed at whole-file scope (imports, sections, format...).
    fn file_features(&self) -> Result<Vec<(Feature, Location)>>;

    /// Top-level instances: functions on the static axis, processes on the
    /// dynamic axis.
    fn roots(&self) -> Result<Vec<InstanceHandle>>;

    /// Direct child instances of `parent` (basic blocks of a function,
    /// threads of a process, ...). Leaf scopes return an empty list.
    fn children(&self, parent: &InstanceHandle) -> Result<Vec<InstanceHandle>>;

    /// Features observed within one scope instance.
    fn features(&self, instance: &InstanceHandle) -> Result<Vec<(Feature, Location)>>;
}

/// An in-memory extractor over pre-recorded features.
///
/// This is the adapter for replayed dynamic traces (the trace is parsed
/// elsewhere and loaded here) and the test double for the evaluator.
pub struct RecordedExtractor {
    axis: ScopeAxis,
    file: Vec<(Feature, Location)>,
    instances: Vec<RecordedInstance>,
}

struct RecordedInstance {
    handle: InstanceHandle,
    parent: Option<Location>,
    features: Vec<(Feature, Location)>,
}

impl RecordedExtractor {
    pub fn new(axis: ScopeAxis) -> Self {
        Self { axis, file: Vec::new(), instances: Vec::new() }
    }

    pub fn add_file_feature(&mut self, feature: Feature, location: Location) -> &mut Self {
        self.file.push((feature, location));
        self
    }

    /// Register a scope instance. Roots pass `parent = None`.
    pub fn add_instance(
        &mut self,
        parent: Option<Location>,
        scope: Scope,
        location: Location,
    ) -> &mut Self {
        self.instances.push(RecordedInstance {
            handle: InstanceHandle::new(scope, location),
            parent,
            features: Vec::new(),
        });
        self
    }

    /// Record a feature inside the instance identified by `instance`.
    ///
    /// Unknown instances are ignored so trace loaders can stream without
    /// ordering guarantees between sections.
    pub fn add_feature(
        &mut self,
        instance: Location,
        feature: Feature,
        observed_at: Location,
    ) -> &mut Self {
        if let Some(recorded) = self
            .instances
            .iter_mut()
            .find(|r| r.handle.location == instance)
        {
            recorded.features.push((feature, observed_at));
        }
        self
    }

    /// Convenience for dynamic traces: register a call instance carrying its
    /// own API-name feature.
    pub fn add_call(&mut self, thread: Location, call: Location, api: &str) -> &mut Self {
        self.add_instance(Some(thread), Scope::Call, call);
        self.add_feature(call, Feature::Api(api.to_string()), call);
        self
    }
}

impl FeatureExtractor for RecordedExtractor {
    fn axis(&self) -> ScopeAxis {
        self.axis
    }

    fn file_features(&self) -> Result<Vec<(Feature, Location)>> {
        Ok(self.file.clone())
    }

    fn roots(&self) -> Result<Vec<InstanceHandle>> {
        Ok(self
            .instances
            .iter()
            .filter(|r| r.parent.is_none())
            .map(|r| r.handle)
            .collect())
    }

    fn children(&self, parent: &InstanceHandle) -> Result<Vec<InstanceHandle>> {
        Ok(self
            .instances
            .iter()
            .filter(|r| r.parent == Some(parent.location))
            .map(|r| r.handle)
            .collect())
    }

    fn features(&self, instance: &InstanceHandle) -> Result<Vec<(Feature, Location)>> {
        Ok(self
            .instances
            .iter()
            .find(|r| r.handle == *instance)
            .map(|r| r.features.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_hierarchy() {
        let process = Location::Process { pid: 2176, ppid: 0 };
        let thread = Location::Thread { pid: 2176, ppid: 0, tid: 7 };
        let call = Location::Call { pid: 2176, ppid: 0, tid: 7, call_id: 2361 };

        let mut extractor = RecordedExtractor::new(ScopeAxis::Dynamic);
        extractor.add_instance(None, Scope::Process, process);
        extractor.add_instance(Some(process), Scope::Thread, thread);
        extractor.add_call(thread, call, "GetAddrInfoW");

        let roots = extractor.roots().unwrap();
        assert_eq!(roots, vec![InstanceHandle::new(Scope::Process, process)]);

        let threads = extractor.children(&roots[0]).unwrap();
        assert_eq!(threads.len(), 1);

        let calls = extractor.children(&threads[0]).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            extractor.features(&calls[0]).unwrap(),
            vec![(Feature::Api("GetAddrInfoW".to_string()), call)]
        );
    }
}
