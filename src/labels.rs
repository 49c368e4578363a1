//! Ownership labels and annotations stamped on resources.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Label holding the name of the environment that deployed a resource.
pub const DEPLOYED_BY_LABEL: &str = "dev.okteto.com/deployed-by";

/// Annotation set on resources deployed from a sample repository.
pub const SAMPLE_ANNOTATION: &str = "dev.okteto.com/sample";

/// Maximum length of a label value.
const MAX_LABEL_VALUE_LENGTH: usize = 63;

/// Git remotes whose repositories are published samples.
const SAMPLE_REPOSITORY_PREFIXES: &[&str] = &[
    "https://github.com/okteto/",
    "git@github.com:okteto/",
    "ssh://git@github.com/okteto/",
];

/// Sets `key=value` in the metadata labels, keeping every other label.
pub fn set_in_metadata(metadata: &mut ObjectMeta, key: &str, value: &str) {
    metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(key.to_string(), value.to_string());
}

/// Sets `key=value` in the metadata annotations, keeping every other annotation.
pub fn set_annotation(metadata: &mut ObjectMeta, key: &str, value: &str) {
    metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(key.to_string(), value.to_string());
}

/// Turns an arbitrary name into a valid label value.
///
/// Lowercases, replaces characters outside `[a-z0-9.-]` with `-`, truncates
/// to 63 characters and trims non-alphanumeric characters from both ends.
pub fn sanitize_name(name: &str) -> String {
    let replaced: String = name
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' | '.' => c,
            _ => '-',
        })
        .take(MAX_LABEL_VALUE_LENGTH)
        .collect();

    replaced
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// Checks whether a git remote URL points at a published sample repository.
pub fn is_sample_repository(remote_url: &str) -> bool {
    let remote = remote_url.trim().to_lowercase();
    SAMPLE_REPOSITORY_PREFIXES
        .iter()
        .any(|prefix| remote.starts_with(prefix))
}
