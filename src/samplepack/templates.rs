// The deps stage only ever sees the base image and the manifest. Anything that changes per
// sample lands in the second stage, so editing a script never re-runs the install.
pub static TEMPLATE_DOCKERFILE: &str = r#"# Samplepack recipe for sample "{{token}}"
{{#each layers}}
{{#if (eq kind "Base")}}
FROM {{image}} AS deps
{{/if}}
{{#if (eq kind "CopyManifest")}}
COPY {{json_args src dest}}
{{/if}}
{{#if (eq kind "InstallDependencies")}}
RUN {{exec}}

FROM deps
{{/if}}
{{#if (eq kind "CopyLibrary")}}
COPY {{json_args src dest}}
{{/if}}
{{#if (eq kind "CopyScript")}}
COPY {{json_args src dest}}
{{/if}}
{{#if (eq kind "Entry")}}
LABEL io.samplepack.sample="{{@root.token}}" io.samplepack.manifest-digest="{{@root.manifest_digest}}"
ENTRYPOINT {{exec}}
{{/if}}
{{/each}}
"#;

pub static DEPS_STAGE: &str = "deps";

pub static DOCKER_IGNORE: &str = r#"
**/.git
**/__pycache__
*.pyc
"#;
