//! Running many methods through the analysis.
//!
//! Methods are independent of each other; the only shared state lives in the
//! environment's resolver caches and importer table, both of which are
//! concurrent maps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use serde::Serialize;

use crate::analysis::{AnalysisEnvironment, AnalysisState, MethodAnalysisContext, MethodReport};
use crate::arch::InstructionSet;
use crate::cfg::ExceptionRegion;
use crate::types::ManagedMethod;
use crate::{Address, BinaryImage};

/// One method to rebuild.
#[derive(Debug, Clone)]
pub struct MethodJob {
    pub address: Address,
    /// Body length from metadata, when known
    pub length: Option<u64>,
    pub method: Arc<ManagedMethod>,
    pub exception_regions: Vec<ExceptionRegion>,
}

impl MethodJob {
    pub fn new(address: Address, length: Option<u64>, method: Arc<ManagedMethod>) -> Self {
        Self {
            address,
            length,
            method,
            exception_regions: Vec::new(),
        }
    }

    pub fn with_exception_regions(mut self, regions: Vec<ExceptionRegion>) -> Self {
        self.exception_regions = regions;
        self
    }
}

/// Counts for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub analysed: usize,
    pub emittable: usize,
    pub tainted: usize,
}

impl RunSummary {
    pub fn from_reports(reports: &[MethodReport]) -> Self {
        reports.iter().fold(Self::default(), |mut summary, report| {
            summary.analysed += 1;
            match report.state {
                AnalysisState::Emittable => summary.emittable += 1,
                AnalysisState::Tainted => summary.tainted += 1,
                _ => {}
            }
            summary
        })
    }
}

/// Analyse a single method.
pub fn analyze_method(
    isa: &dyn InstructionSet,
    image: &BinaryImage,
    env: &AnalysisEnvironment,
    job: &MethodJob,
) -> MethodReport {
    let mut ctx = MethodAnalysisContext::new(job.address, job.length, job.method.clone())
        .with_exception_regions(job.exception_regions.clone());
    ctx.analyze(isa, image, env)
}

/// Analyse every job with a managed body, in parallel when the options allow.
///
/// `cancel` is checked before each method starts; methods already running
/// finish and are reported. Reports come back in job order.
pub fn analyze_methods(
    isa: &dyn InstructionSet,
    image: &BinaryImage,
    env: &AnalysisEnvironment,
    jobs: &[MethodJob],
    cancel: &AtomicBool,
) -> Vec<MethodReport> {
    let run = |job: &MethodJob| -> Option<MethodReport> {
        if cancel.load(Ordering::Relaxed) {
            return None;
        }
        if !job.method.has_body() {
            log::debug!(
                "Skipping {}: {:?} method has no managed body",
                job.method.full_name(),
                job.method.implementation
            );
            return None;
        }
        Some(analyze_method(isa, image, env, job))
    };

    let reports: Vec<MethodReport> = if env.options.parallel {
        jobs.par_iter().filter_map(run).collect()
    } else {
        jobs.iter().filter_map(run).collect()
    };

    let summary = RunSummary::from_reports(&reports);
    if cancel.load(Ordering::Relaxed) {
        log::info!(
            "Run cancelled after {} of {} methods",
            summary.analysed,
            jobs.len()
        );
    }
    log::info!(
        "Analysed {} methods: {} emittable, {} tainted",
        summary.analysed,
        summary.emittable,
        summary.tainted
    );
    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::X86_64InstructionSet;
    use crate::config::AnalysisOptions;
    use crate::types::{
        InMemoryMetadata, MethodImplementation, PrimitiveKind, TypeDefinition, TypeResolver,
        TypeSignature, TypeTable,
    };
    use crate::Architecture;
    use rstest::rstest;

    static X86: X86_64InstructionSet = X86_64InstructionSet::new();

    // 0x1000: lea eax, [rcx + rcx] ; ret   (indexed lea leaves eax unknown)
    // 0x1010: mov eax, ecx ; add eax, ecx ; ret
    fn image() -> BinaryImage {
        let mut code = vec![0xcc; 0x20];
        code[..4].copy_from_slice(&[0x8d, 0x04, 0x09, 0xc3]);
        code[0x10..0x15].copy_from_slice(&[0x89, 0xc8, 0x01, 0xc8, 0xc3]);
        BinaryImage::raw(Architecture::X86_64, 0x1000, &code)
    }

    fn environment(parallel: bool) -> AnalysisEnvironment {
        let table = Arc::new(TypeTable::new(Vec::new()));
        let resolver = Arc::new(TypeResolver::new(table, Arc::new(InMemoryMetadata::new(27.0))));
        let options = AnalysisOptions {
            parallel,
            ..AnalysisOptions::default()
        };
        AnalysisEnvironment::new(resolver, options)
    }

    fn jobs(env: &AnalysisEnvironment) -> Vec<MethodJob> {
        let owner = TypeDefinition::new("Game", "Math").into_handle();
        let int32 = TypeSignature::Definition(env.resolver.table().primitive(PrimitiveKind::Int32).clone());
        let method = |name: &str| {
            ManagedMethod::new(name, owner.clone(), int32.clone())
                .with_static(true)
                .with_parameter("a", int32.clone())
        };
        vec![
            MethodJob::new(0x1000, None, Arc::new(method("Lea"))),
            MethodJob::new(0x1010, None, Arc::new(method("Twice"))),
            MethodJob::new(
                0x1018,
                None,
                Arc::new(method("Extern").with_implementation(MethodImplementation::InternalCall)),
            ),
        ]
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn test_analyze_methods(#[case] parallel: bool) {
        let env = environment(parallel);
        let jobs = jobs(&env);
        let reports = analyze_methods(&X86, &image(), &env, &jobs, &AtomicBool::new(false));

        // The internal call is skipped.
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].address, 0x1000);
        assert!(reports[0].is_tainted());
        assert_eq!(reports[1].state, AnalysisState::Emittable);
        assert!(reports[1].pseudocode.contains("System.Int32 local0 = a + a"));

        let summary = RunSummary::from_reports(&reports);
        assert_eq!(
            summary,
            RunSummary {
                analysed: 2,
                emittable: 1,
                tainted: 1
            }
        );
    }

    #[test]
    fn test_cancelled_run_reports_nothing() {
        let env = environment(false);
        let jobs = jobs(&env);
        let reports = analyze_methods(&X86, &image(), &env, &jobs, &AtomicBool::new(true));
        assert!(reports.is_empty());
    }
}
