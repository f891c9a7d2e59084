//! Variables exposed to templates, hooks and functions.

use std::collections::BTreeMap;
use std::path::Path;

use crate::config::schema::Function;
use crate::config::{Deployment, Service};
use crate::policy::PolicyRef;
use crate::supervisor::units::function_id;

pub type Vars = BTreeMap<String, String>;

/// Config keys verbatim plus the service's identity.
pub fn service_vars(service: &Service) -> Vars {
    let mut vars: Vars = service
        .config
        .iter()
        .map(|(k, v)| (k.clone(), v.as_env()))
        .collect();
    vars.insert("CONDUCTOR_APP".into(), service.app.clone());
    vars.insert("CONDUCTOR_INSTANCE".into(), service.instance.clone());
    vars.insert("CONDUCTOR_SERVICE".into(), service.name());
    vars.insert("CONDUCTOR_SERVICE_DIR".into(), service.dir.display().to_string());
    vars.insert("CONDUCTOR_SERVICE_ID".into(), service.id.clone());
    vars
}

/// Name of the config map generated from the service's `config`.
pub fn config_map_name(deployment: &str) -> String {
    format!("{deployment}-config")
}

/// Service variables plus the deployment's name, directory, pod name and IP.
///
/// `POD_IP_ADDRESS` is empty until the pod has been started.
pub fn deployment_vars(service: &Service, deployment: &Deployment, dir: &Path) -> Vars {
    let mut vars = service_vars(service);
    vars.insert("CONDUCTOR_DEPLOYMENT".into(), deployment.name.clone());
    vars.insert("CONDUCTOR_DEPLOYMENT_DIR".into(), dir.display().to_string());
    vars.insert("CONDUCTOR_CONFIG_MAP".into(), config_map_name(&deployment.name));
    vars.insert(
        "CONDUCTOR_PART".into(),
        deployment.part.clone().unwrap_or_default(),
    );
    vars.insert(
        "POD_NAME".into(),
        deployment.pod_name.clone().unwrap_or_else(|| deployment.name.clone()),
    );
    vars.insert(
        "POD_IP_ADDRESS".into(),
        deployment.pod_ip.clone().unwrap_or_default(),
    );
    vars
}

/// Socket path of a function inside its deployment directory.
pub fn function_socket(dir: &Path, function: &str) -> std::path::PathBuf {
    dir.join(format!("{function}.sock"))
}

/// Deployment variables plus the function's id, socket and policies.
///
/// Policies are the function's own followed by the service's, each as
/// `name/authorization`.
pub fn function_vars(
    service: &Service,
    deployment: &Deployment,
    dir: &Path,
    function: &Function,
) -> Vars {
    let mut vars = deployment_vars(service, deployment, dir);
    vars.insert(
        "CONDUCTOR_FUNCTION_ID".into(),
        function_id(&deployment.name, &function.name),
    );
    vars.insert(
        "CONDUCTOR_FUNCTION_SOCKET".into(),
        function_socket(dir, &function.name).display().to_string(),
    );
    let policies: Vec<String> = function
        .policies
        .iter()
        .chain(service.policies.iter())
        .map(|p| PolicyRef::parse(p).to_string())
        .collect();
    vars.insert("CONDUCTOR_FUNCTION_POLICIES".into(), policies.join(" "));
    vars
}
