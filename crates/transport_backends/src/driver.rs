//! Translation driver.
//!
//! Every pass builds its own registry, tensor set and CSE state, so passes for
//! different backends share nothing mutable and run in parallel.

use crate::flow_tensors::FlowTensors;
use crate::languages::{Language, LanguagePackage};
use crate::model_info::ModelInfo;
use anyhow::{Context, Result};
use log::info;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use transport_core::codegen::{MacroEngine, PassOutput, ReplacementRulePackage, RuleContext, RuleRegistry};
use transport_core::error::{ConfigurationError, PassError};
use transport_core::printer::Printer;
use transport_core::{Model, ModelDescription, TensorSet, TranslatorSettings};

/// Packages registered for `language`.
pub fn packages(language: Language) -> Vec<Arc<dyn ReplacementRulePackage>> {
    vec![
        Arc::new(ModelInfo),
        Arc::new(FlowTensors),
        Arc::new(LanguagePackage::new(language)),
    ]
}

/// Translates `template` for `backend`.
pub fn translate(
    model: &Model,
    backend: &str,
    template: &str,
    settings: &TranslatorSettings,
) -> Result<PassOutput, PassError> {
    let fatal = |source: ConfigurationError| PassError::Configuration {
        backend: backend.to_string(),
        source,
        diagnostics: Vec::new(),
    };
    let language: Language = backend.parse().map_err(fatal)?;
    let registry = RuleRegistry::with_packages(language.id(), &packages(language)).map_err(fatal)?;
    translate_with(model, &registry, Arc::new(language.printer()), template, settings)
}

/// Runs one pass against an explicit registry and printer.
pub fn translate_with(
    model: &Model,
    registry: &RuleRegistry,
    printer: Arc<dyn Printer>,
    template: &str,
    settings: &TranslatorSettings,
) -> Result<PassOutput, PassError> {
    let mut tensors = TensorSet::new(model.clone(), settings).map_err(|source| PassError::Configuration {
        backend: registry.backend().to_string(),
        source,
        diagnostics: Vec::new(),
    })?;
    let mut ctx = RuleContext::new(&mut tensors, settings, printer);
    MacroEngine::new(registry).run(template, &mut ctx)
}

/// One backend pass: the backend identifier and its template text.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslationJob {
    pub backend: String,
    pub template: String,
    pub source: Option<PathBuf>,
}

impl TranslationJob {
    pub fn new(backend: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            template: template.into(),
            source: None,
        }
    }

    pub fn from_file(backend: impl Into<String>, path: &Path) -> Result<Self> {
        let template = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read template {}", path.display()))?;
        Ok(Self {
            backend: backend.into(),
            template,
            source: Some(path.to_path_buf()),
        })
    }
}

/// Runs every job in parallel. Results are in job order; a failed pass never
/// affects the others.
pub fn translate_all(
    model: &Model,
    jobs: &[TranslationJob],
    settings: &TranslatorSettings,
) -> Vec<Result<PassOutput, PassError>> {
    info!(
        "translating {} template(s) for model '{}' on {} thread(s)",
        jobs.len(),
        model.name(),
        rayon::current_num_threads()
    );
    jobs.par_iter()
        .map(|job| translate(model, &job.backend, &job.template, settings))
        .collect()
}

pub fn load_model(path: &Path) -> Result<Model> {
    let description = ModelDescription::load(path)?;
    Model::from_description(description).with_context(|| format!("Invalid model in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport_core::error::{Location, TranslationError};
    use test_log::test;

    const MODEL: &str = r#"{
        "name": "double quadratic",
        "author": "Transport developers",
        "fields": ["phi", "chi"],
        "parameters": ["m_phi", "m_chi"],
        "potential": "m_phi^2*phi^2/2 + m_chi^2*chi^2/2"
    }"#;

    fn model() -> Model {
        let description = ModelDescription::from_json(MODEL).expect("description should parse");
        Model::from_description(description).expect("valid model")
    }

    const CPP_TEMPLATE: &str = "#ifndef $GUARD{mpi}
#define $GUARD{mpi}
// $MODEL, backend $BACKEND
void u2($REAL_TYPE Hsq, $REAL_TYPE eps, $REAL_TYPE k, $REAL_TYPE a, const $REAL_TYPE* __x, $REAL_TYPE* __u2)
  {
    const $REAL_TYPE $COORDINATE[A] = __x[$IDX[A]];
    const $REAL_TYPE $PARAMETER[α] = __params[$IDX[α]];
    $TEMP_POOL{\"const double $1 = $2;\"}
    __u2[$FLATTEN[AB]] = $U2[AB]{k, a, Hsq, eps};
  }
#endif
";

    #[test]
    fn cpp_template_end_to_end() {
        let output = translate(&model(), "cpp", CPP_TEMPLATE, &TranslatorSettings::default()).expect("translates");
        let lines: Vec<&str> = output.text.lines().collect();
        assert_eq!(lines[0], "#ifndef __TRANSPORT_DOUBLE_QUADRATIC_MPI_H");
        assert_eq!(lines[2], "// double quadratic, backend cpp");
        assert!(lines[3].starts_with("void u2(double Hsq"));
        assert_eq!(lines[5], "    const double phi = __x[0];");
        assert_eq!(lines[8], "    const double __dchi = __x[3];");
        assert_eq!(lines[10], "    const double m_chi = __params[1];");

        let first_component = lines
            .iter()
            .position(|l| l.starts_with("    __u2["))
            .expect("components emitted");
        assert_eq!(lines[first_component], "    __u2[0] = 0.0;");
        assert!(lines[11..first_component]
            .iter()
            .all(|l| l.starts_with("    const double __t_")));
        assert_eq!(lines.iter().filter(|l| l.starts_with("    __u2[")).count(), 16);
        assert_eq!(lines.last(), Some(&"#endif"));
        assert!(!output.text.contains('$'));
    }

    #[test]
    fn sibling_passes_are_isolated() {
        let jobs = vec![
            TranslationJob::new(
                "cpp",
                "$TEMP_POOL{\"const double $1 = $2;\"}\n$REAL_TYPE du[$IDX[A]] = $U1[A]{Hsq, eps};\n",
            ),
            TranslationJob::new("cuda", "int i = $THREAD_INDEX;\n$REAL_TYPE x = $U1[A]{Hsq};\n"),
            TranslationJob::new("opencl", "void f($KERNEL_ARGUMENT{double, x}) { int i = $THREAD_INDEX; }\n"),
            TranslationJob::new("vexcl", "$MATERIALIZE{0, x + y};\n"),
        ];
        let results = translate_all(&model(), &jobs, &TranslatorSettings::default());
        assert_eq!(results.len(), 4);

        let cpp = results[0].as_ref().expect("cpp pass succeeds");
        assert_eq!(cpp.backend, "cpp");
        assert_eq!(cpp.text.lines().filter(|l| l.starts_with("double du[")).count(), 4);

        let cuda = results[1].as_ref().expect_err("cuda pass fails");
        assert_eq!(cuda.backend(), "cuda");
        assert_eq!(
            cuda.diagnostics(),
            [TranslationError::ArityMismatch {
                token: "U1".to_string(),
                expected: 2,
                found: 1,
                location: Location::new(2, 16),
            }]
        );

        let opencl = results[2].as_ref().expect("opencl pass succeeds");
        assert_eq!(opencl.text, "void f(__global double* x) { int i = get_global_id(0); }\n");

        let vexcl = results[3].as_ref().expect("vexcl pass succeeds");
        assert_eq!(vexcl.text, "vex::make_temp<0>(x + y);\n");
    }

    #[test]
    fn kernel_directives_are_unknown_to_host_backends() {
        let err = translate(&model(), "cpp", "$IMPORT_KERNEL{u2.cl}\n", &TranslatorSettings::default())
            .expect_err("cpp has no kernels");
        assert!(matches!(
            err.diagnostics(),
            [TranslationError::UnresolvedDirective { token, .. }] if token == "IMPORT_KERNEL"
        ));
        let output = translate(&model(), "cuda", "$IMPORT_KERNEL{u2.cu}\n", &TranslatorSettings::default())
            .expect("cuda imports kernels");
        assert_eq!(output.text, "#include \"u2.cu\"\n");
    }

    #[test]
    fn duplicate_kernel_import_fails_registration() {
        let mut packages = packages(Language::Cuda);
        packages.push(Arc::new(LanguagePackage::new(Language::Cuda)));
        let err = RuleRegistry::with_packages("cuda", &packages).expect_err("duplicate tokens");
        assert!(matches!(err, ConfigurationError::DuplicateToken { ref backend, .. } if backend == "cuda"));
    }

    #[test]
    fn unknown_backend_is_a_configuration_error() {
        let err = translate(&model(), "fortran", "x\n", &TranslatorSettings::default()).expect_err("unknown");
        assert_eq!(
            err,
            PassError::Configuration {
                backend: "fortran".to_string(),
                source: ConfigurationError::UnknownBackend {
                    backend: "fortran".to_string()
                },
                diagnostics: Vec::new(),
            }
        );
    }

    #[test]
    fn models_and_templates_load_from_disk() {
        let dir = std::env::temp_dir().join(format!("transport_backends_{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("temp dir");
        let model_path = dir.join("model.json");
        let template_path = dir.join("u1.h");
        std::fs::write(&model_path, MODEL).expect("write model");
        std::fs::write(&template_path, "// $MODEL\n").expect("write template");

        let model = load_model(&model_path).expect("model loads");
        let job = TranslationJob::from_file("cpp", &template_path).expect("template loads");
        assert_eq!(job.source.as_deref(), Some(template_path.as_path()));
        let results = translate_all(&model, &[job], &TranslatorSettings::default());
        assert_eq!(results[0].as_ref().expect("translates").text, "// double quadratic\n");

        let missing = load_model(&dir.join("missing.json")).expect_err("no such file");
        assert!(format!("{:#}", missing).contains("missing.json"));
        std::fs::remove_dir_all(&dir).expect("cleanup");
    }
}
