//! Per-language post-rules and printers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use transport_core::codegen::{Arity, PlainRule, ReplacementRulePackage};
use transport_core::error::ConfigurationError;
use transport_core::printer::CStylePrinter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Cpp,
    Vexcl,
    OpenCl,
    Cuda,
}

impl Language {
    pub const ALL: [Language; 4] = [Language::Cpp, Language::Vexcl, Language::OpenCl, Language::Cuda];

    /// Backend identifier used to select rule packages.
    pub fn id(&self) -> &'static str {
        match self {
            Language::Cpp => "cpp",
            Language::Vexcl => "vexcl",
            Language::OpenCl => "opencl",
            Language::Cuda => "cuda",
        }
    }

    /// Kernel languages compile device code from separate kernel sources.
    pub fn has_kernels(&self) -> bool {
        matches!(self, Language::OpenCl | Language::Cuda)
    }

    pub fn printer(&self) -> CStylePrinter {
        let function_prefix = match self {
            Language::Cpp => "std::",
            Language::Vexcl | Language::OpenCl | Language::Cuda => "",
        };
        CStylePrinter {
            name: self.id().to_string(),
            function_prefix: function_prefix.to_string(),
            ..CStylePrinter::default()
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Language {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Language::ALL
            .iter()
            .copied()
            .find(|l| l.id() == s)
            .ok_or_else(|| ConfigurationError::UnknownBackend {
                backend: s.to_string(),
            })
    }
}

/// Post-rules spelling language constructs; registered only for its own
/// backend.
#[derive(Debug, Clone, Copy)]
pub struct LanguagePackage {
    language: Language,
}

impl LanguagePackage {
    pub fn new(language: Language) -> Self {
        Self { language }
    }

    pub fn language(&self) -> Language {
        self.language
    }
}

impl ReplacementRulePackage for LanguagePackage {
    fn name(&self) -> &str {
        self.language.id()
    }

    fn supports(&self, backend: &str) -> bool {
        backend == self.language.id()
    }

    fn post_rules(&self) -> Vec<PlainRule> {
        let language = self.language;
        let mut rules = vec![
            PlainRule::constant("BACKEND", language.id()),
            PlainRule::constant("REAL_TYPE", "double"),
            // $MATERIALIZE{n, expr}: force evaluation of a lazy expression
            // into temporary slot n.
            PlainRule::new("MATERIALIZE", Arity::Exact(2), move |_, args| {
                Ok(match language {
                    Language::Vexcl => format!("vex::make_temp<{}>({})", args[0], args[1]),
                    Language::Cpp | Language::OpenCl | Language::Cuda => args[1].clone(),
                })
            }),
        ];
        if language.has_kernels() {
            rules.push(PlainRule::new("IMPORT_KERNEL", Arity::Exact(1), |_, args| {
                Ok(format!("#include \"{}\"", args[0]))
            }));
            rules.push(PlainRule::new("KERNEL_ARGUMENT", Arity::Exact(2), move |_, args| {
                Ok(match language {
                    Language::OpenCl => format!("__global {}* {}", args[0], args[1]),
                    _ => format!("{}* __restrict__ {}", args[0], args[1]),
                })
            }));
            let thread_index = match language {
                Language::OpenCl => "get_global_id(0)",
                _ => "(blockIdx.x*blockDim.x + threadIdx.x)",
            };
            rules.push(PlainRule::constant("THREAD_INDEX", thread_index));
        }
        rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use transport_core::codegen::{RuleKind, RuleRegistry};
    use transport_core::printer::Printer;
    use transport_core::symbolic::{Expr, Function};
    use test_log::test;

    #[test]
    fn backend_identifiers_round_trip() {
        for language in Language::ALL {
            assert_eq!(language.id().parse::<Language>().expect("known backend"), language);
        }
        assert_eq!(
            "fortran".parse::<Language>(),
            Err(ConfigurationError::UnknownBackend {
                backend: "fortran".to_string()
            })
        );
    }

    #[test]
    fn kernel_rules_exist_only_for_kernel_languages() {
        let packages: Vec<Arc<dyn ReplacementRulePackage>> = Language::ALL
            .iter()
            .map(|l| Arc::new(LanguagePackage::new(*l)) as Arc<dyn ReplacementRulePackage>)
            .collect();
        let cpp = RuleRegistry::with_packages("cpp", &packages).expect("one package per backend");
        assert_eq!(cpp.packages(), ["cpp".to_string()]);
        assert_eq!(cpp.kind("IMPORT_KERNEL"), None);
        assert_eq!(cpp.kind("MATERIALIZE"), Some(RuleKind::Post));

        let cuda = RuleRegistry::with_packages("cuda", &packages).expect("one package per backend");
        assert_eq!(cuda.owner("THREAD_INDEX"), Some("cuda"));
    }

    #[test]
    fn printers_differ_in_function_spelling() {
        let x = Expr::symbol("x");
        let e = Expr::func(Function::Exp, x);
        assert_eq!(Language::Cpp.printer().render(&e), "std::exp(x)");
        assert_eq!(Language::Cuda.printer().render(&e), "exp(x)");
        assert_eq!(Language::OpenCl.printer().name(), "opencl");
    }
}
