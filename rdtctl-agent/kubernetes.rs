//! Class lookup from Kubernetes pod and container annotations

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{RdtError, Result};
use crate::groups::RdtControl;
use crate::resolver::{is_qualified_class_name, unalias_class_name};

/// Container annotation set by the container runtime
pub const RDT_CONTAINER_ANNOTATION: &str = "io.kubernetes.cri.rdt-class";

/// Pod annotation applying to all containers of the pod
pub const RDT_POD_ANNOTATION: &str = "rdt.resources.beta.kubernetes.io/pod";

/// Prefix of pod annotations applying to a single container
pub const RDT_POD_ANNOTATION_CONTAINER_PREFIX: &str = "rdt.resources.beta.kubernetes.io/container.";

/// Where a class assignment was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassOrigin {
    NotFound,
    ContainerAnnotation,
    PodAnnotation,
}

impl fmt::Display for ClassOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "<not found>",
            Self::ContainerAnnotation => "container annotations",
            Self::PodAnnotation => "pod annotations",
        };
        f.write_str(s)
    }
}

/// Class requested for a container
///
/// A container annotation takes precedence over a per-container pod
/// annotation, which takes precedence over the pod-wide one.
pub fn container_class_from_annotations(
    container_name: &str,
    container_annotations: &BTreeMap<String, String>,
    pod_annotations: &BTreeMap<String, String>,
) -> (String, ClassOrigin) {
    if let Some(class) = container_annotations.get(RDT_CONTAINER_ANNOTATION) {
        return (class.clone(), ClassOrigin::ContainerAnnotation);
    }

    let key = format!("{RDT_POD_ANNOTATION_CONTAINER_PREFIX}{container_name}");
    if let Some(class) = pod_annotations
        .get(&key)
        .or_else(|| pod_annotations.get(RDT_POD_ANNOTATION))
    {
        return (class.clone(), ClassOrigin::PodAnnotation);
    }

    (String::new(), ClassOrigin::NotFound)
}

impl RdtControl {
    /// Class of a container from its annotations, validated against the
    /// active configuration
    ///
    /// Returns an empty name if the container has no class annotation.
    pub fn container_class_from_annotations(
        &self,
        container_name: &str,
        container_annotations: &BTreeMap<String, String>,
        pod_annotations: &BTreeMap<String, String>,
    ) -> Result<String> {
        let (class, origin) =
            container_class_from_annotations(container_name, container_annotations, pod_annotations);
        if origin == ClassOrigin::NotFound {
            return Ok(class);
        }

        if !is_qualified_class_name(&class) {
            return Err(RdtError::InvalidClassName(class));
        }

        match self.config() {
            Some(conf) => {
                let Some(class_conf) = conf.classes.get(unalias_class_name(&class)) else {
                    return Err(RdtError::UnknownClass(class));
                };
                let kubernetes = class_conf.kubernetes;
                let denied = match origin {
                    ClassOrigin::ContainerAnnotation => kubernetes.deny_container_annotation,
                    ClassOrigin::PodAnnotation => kubernetes.deny_pod_annotation,
                    ClassOrigin::NotFound => false,
                };
                if denied {
                    return Err(RdtError::AnnotationDenied {
                        class,
                        origin: origin.to_string(),
                    });
                }
            }
            // Without a configuration any discovered class is accepted
            None if self.get_class(&class).is_none() => {
                return Err(RdtError::UnknownClass(class));
            }
            None => {}
        }

        Ok(class)
    }
}

/// Class of a container, requiring an initialized control handle if the
/// container has a class annotation
pub fn container_class(
    control: Option<&RdtControl>,
    container_name: &str,
    container_annotations: &BTreeMap<String, String>,
    pod_annotations: &BTreeMap<String, String>,
) -> Result<String> {
    match control {
        Some(control) => control.container_class_from_annotations(
            container_name,
            container_annotations,
            pod_annotations,
        ),
        None => {
            let (class, origin) =
                container_class_from_annotations(container_name, container_annotations, pod_annotations);
            if origin == ClassOrigin::NotFound {
                Ok(class)
            } else {
                Err(RdtError::NotInitialized)
            }
        }
    }
}
