use super::{ADOPTION_POLICIES, DELETION_POLICIES, PackageVariantSetSpec, Target, ValueOrFromField};
use crate::error::FieldErrors;

/// Check a set spec, collecting every problem
pub fn validate(spec: &PackageVariantSetSpec) -> FieldErrors {
    let mut errors = FieldErrors::new();
    match &spec.upstream {
        None => errors.push("spec.upstream", "upstream is required"),
        Some(upstream) => {
            match &upstream.package {
                None => errors.push("spec.upstream.package", "package is required"),
                Some(package) => {
                    if package.name.is_empty() {
                        errors.push("spec.upstream.package.name", "value is required");
                    }
                    if package.repo.is_empty() {
                        errors.push("spec.upstream.package.repo", "value is required");
                    }
                }
            }
            if upstream.revision.is_empty() == upstream.tag.is_empty() {
                errors.push("spec.upstream", "exactly one of revision and tag must be set");
            }
        }
    }

    if spec.targets.is_empty() {
        errors.push("spec.targets", "at least one target is required");
    }
    for (i, target) in spec.targets.iter().enumerate() {
        validate_target(target, &format!("spec.targets[{i}]"), &mut errors);
    }

    if !spec.adoption_policy.is_empty() && !ADOPTION_POLICIES.contains(&spec.adoption_policy.as_str()) {
        errors.push(
            "spec.adoptionPolicy",
            format!("must be one of {}", ADOPTION_POLICIES.join(", ")),
        );
    }
    if !spec.deletion_policy.is_empty() && !DELETION_POLICIES.contains(&spec.deletion_policy.as_str()) {
        errors.push(
            "spec.deletionPolicy",
            format!("must be one of {}", DELETION_POLICIES.join(", ")),
        );
    }
    errors
}

fn validate_target(target: &Target, field: &str, errors: &mut FieldErrors) {
    let forms = [target.package.is_some(), target.repositories.is_some(), target.objects.is_some()];
    if forms.iter().filter(|set| **set).count() != 1 {
        errors.push(field, "exactly one of package, repositories and objects must be set");
        return;
    }
    if let Some(package) = &target.package {
        if package.repo.is_empty() {
            errors.push(format!("{field}.package.repo"), "value is required");
        }
    }
    if let Some(repositories) = &target.repositories {
        if repositories.labels.is_empty() && repositories.names.is_empty() {
            errors.push(format!("{field}.repositories"), "labels or names are required");
        }
        if let Some(name) = &repositories.package_name {
            validate_value_or_field(name, &format!("{field}.repositories.packageName"), errors);
        }
    }
    if let Some(objects) = &target.objects {
        if objects.selectors.is_empty() {
            errors.push(format!("{field}.objects.selectors"), "at least one selector is required");
        }
        for (i, selector) in objects.selectors.iter().enumerate() {
            let at = format!("{field}.objects.selectors[{i}]");
            if selector.api_version.is_empty() {
                errors.push(format!("{at}.apiVersion"), "value is required");
            }
            if selector.kind.is_empty() {
                errors.push(format!("{at}.kind"), "value is required");
            }
        }
        match &objects.repo_name {
            None => errors.push(format!("{field}.objects.repoName"), "value is required"),
            Some(repo) => validate_value_or_field(repo, &format!("{field}.objects.repoName"), errors),
        }
        if let Some(name) = &objects.package_name {
            validate_value_or_field(name, &format!("{field}.objects.packageName"), errors);
        }
    }
}

fn validate_value_or_field(value: &ValueOrFromField, field: &str, errors: &mut FieldErrors) {
    if value.value.is_empty() == value.from_field.is_empty() {
        errors.push(field, "exactly one of value and fromField must be set");
    } else if !value.from_field.is_empty() {
        if let Err(e) = crate::resources::fieldpath::FieldPath::parse(&value.from_field) {
            errors.push(format!("{field}.fromField"), e.to_string());
        }
    }
}
