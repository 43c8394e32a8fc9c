//! Compose bundle rendering.
//!
//! Emits `docker-compose.yml`, `.env`, and the `.secrets/` subtree under the
//! generated-artifact directory. Rendering is a pure function of the
//! configuration document and the secrets snapshot; it is rerun whenever
//! either changes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use convoy_config::StackConfig;
use minijinja::{context, Environment, ErrorKind};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{ComposeError, ComposeResult};

/// `service → key → value` secrets snapshot handed to the renderer.
pub type SecretsSnapshot = BTreeMap<String, BTreeMap<String, String>>;

const COMPOSE_TEMPLATE: &str = "docker-compose.yml.j2";
const ENV_TEMPLATE: &str = "env.j2";
const SECRETS_SUBDIR: &str = "secrets";
const TEMPLATE_SUFFIX: &str = ".j2";

/// Artifacts produced by one render pass.
#[derive(Debug, Clone)]
pub struct RenderResult {
    /// Rendered compose file.
    pub compose_path: PathBuf,
    /// Rendered environment file.
    pub env_path: PathBuf,
    /// Root of the rendered secret files, when the template tree has any.
    pub secrets_dir: Option<PathBuf>,
    /// Rendered secret files keyed by their template-relative path.
    pub secret_files: BTreeMap<String, PathBuf>,
}

/// Renders the compose bundle from a template tree.
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    template_dir: PathBuf,
}

impl TemplateRenderer {
    /// Construct a renderer over the given template directory.
    #[must_use]
    pub fn new(template_dir: impl Into<PathBuf>) -> Self {
        Self {
            template_dir: template_dir.into(),
        }
    }

    /// Render the full bundle into `output_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::TemplateNotFound`] when a required template is
    /// missing, a render error when evaluation fails, or an IO error when an
    /// artifact cannot be written.
    pub fn render(
        &self,
        config: &StackConfig,
        output_dir: &Path,
        secrets: &SecretsSnapshot,
    ) -> ComposeResult<RenderResult> {
        fs::create_dir_all(output_dir)
            .map_err(|source| ComposeError::io("render.output_dir", output_dir, source))?;

        let env = self.environment()?;
        let ctx = build_context(config, secrets);

        let compose_content = render_named(&env, COMPOSE_TEMPLATE, &ctx)?;
        let env_content = render_named(&env, ENV_TEMPLATE, &ctx)?;

        let compose_path = output_dir.join("docker-compose.yml");
        let env_path = output_dir.join(".env");
        fs::write(&compose_path, compose_content)
            .map_err(|source| ComposeError::io("render.compose", &compose_path, source))?;
        fs::write(&env_path, env_content)
            .map_err(|source| ComposeError::io("render.env", &env_path, source))?;

        let (secrets_dir, secret_files) = self.write_secrets(&env, &ctx, output_dir)?;
        Ok(RenderResult {
            compose_path,
            env_path,
            secrets_dir,
            secret_files,
        })
    }

    /// Re-render only the secret files, for use after a client discovers or
    /// mints a credential mid-apply.
    ///
    /// # Errors
    ///
    /// Same contract as [`TemplateRenderer::render`].
    pub fn render_secrets(
        &self,
        config: &StackConfig,
        output_dir: &Path,
        secrets: &SecretsSnapshot,
    ) -> ComposeResult<(Option<PathBuf>, BTreeMap<String, PathBuf>)> {
        fs::create_dir_all(output_dir)
            .map_err(|source| ComposeError::io("render.output_dir", output_dir, source))?;
        let env = self.environment()?;
        let ctx = build_context(config, secrets);
        self.write_secrets(&env, &ctx, output_dir)
    }

    fn environment(&self) -> ComposeResult<Environment<'static>> {
        if !self.template_dir.is_dir() {
            return Err(ComposeError::TemplateNotFound {
                name: self.template_dir.display().to_string(),
            });
        }
        let mut env = Environment::new();
        env.set_loader(minijinja::path_loader(&self.template_dir));
        Ok(env)
    }

    /// Secret templates live under `templates/secrets/` and mirror into
    /// `generated/.secrets/` with the `.j2` suffix stripped.
    fn secret_template_names(&self) -> Vec<String> {
        let secrets_root = self.template_dir.join(SECRETS_SUBDIR);
        if !secrets_root.is_dir() {
            return Vec::new();
        }
        let mut names: Vec<String> = WalkDir::new(&secrets_root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let relative = entry.path().strip_prefix(&self.template_dir).ok()?;
                let name = relative.to_string_lossy().replace('\\', "/");
                name.ends_with(TEMPLATE_SUFFIX).then_some(name)
            })
            .collect();
        names.sort();
        names
    }

    fn write_secrets(
        &self,
        env: &Environment<'static>,
        ctx: &minijinja::Value,
        output_dir: &Path,
    ) -> ComposeResult<(Option<PathBuf>, BTreeMap<String, PathBuf>)> {
        let names = self.secret_template_names();
        if names.is_empty() {
            return Ok((None, BTreeMap::new()));
        }

        let secrets_dir = output_dir.join(".secrets");
        let mut written = BTreeMap::new();
        for name in names {
            let rendered = render_named(env, &name, ctx)?;

            let relative = name
                .trim_start_matches(SECRETS_SUBDIR)
                .trim_start_matches('/')
                .trim_end_matches(TEMPLATE_SUFFIX)
                .to_string();
            let target = secrets_dir.join(&relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .map_err(|source| ComposeError::io("render.secret_dir", parent, source))?;
            }
            fs::write(&target, rendered)
                .map_err(|source| ComposeError::io("render.secret", &target, source))?;
            debug!(secret = %relative, "rendered secret file");
            written.insert(relative, target);
        }
        Ok((Some(secrets_dir), written))
    }
}

fn render_named(
    env: &Environment<'static>,
    name: &str,
    ctx: &minijinja::Value,
) -> ComposeResult<String> {
    let template = env.get_template(name).map_err(|err| {
        if err.kind() == ErrorKind::TemplateNotFound {
            ComposeError::TemplateNotFound {
                name: name.to_string(),
            }
        } else {
            ComposeError::Render {
                name: name.to_string(),
                source: err,
            }
        }
    })?;
    template.render(ctx).map_err(|source| ComposeError::Render {
        name: name.to_string(),
        source,
    })
}

/// Context exposed to the templates: the raw document plus the derived paths
/// the compose file mounts.
fn build_context(config: &StackConfig, secrets: &SecretsSnapshot) -> minijinja::Value {
    let downloads_root = config.paths.scratch.as_ref().map_or_else(
        || config.paths.pool.join("downloads"),
        |scratch| scratch.join("downloads"),
    );
    context! {
        config => minijinja::Value::from_serialize(config),
        secrets => minijinja::Value::from_serialize(secrets),
        derived => context! {
            downloads_root => downloads_root.display().to_string(),
            media_root => config.paths.pool.join("media").display().to_string(),
            appdata_root => config.paths.appdata.display().to_string(),
            project => crate::driver::COMPOSE_PROJECT,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_template(dir: &Path, name: &str, content: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    fn sample_config() -> StackConfig {
        StackConfig::with_paths(
            "/mnt/pool".into(),
            "/mnt/appdata".into(),
            Some("/mnt/scratch".into()),
        )
    }

    #[test]
    fn renders_compose_env_and_secrets() {
        let templates = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        write_template(
            templates.path(),
            COMPOSE_TEMPLATE,
            "services:\n  sonarr:\n    ports:\n      - \"{{ config.services.sonarr.port }}:8989\"\n",
        );
        write_template(templates.path(), ENV_TEMPLATE, "PUID={{ config.runtime.user_id }}\n");
        write_template(
            templates.path(),
            "secrets/qbittorrent/credentials.env.j2",
            "QB_USER={{ secrets.qbittorrent.username }}\n",
        );

        let mut secrets = SecretsSnapshot::new();
        secrets
            .entry("qbittorrent".to_string())
            .or_default()
            .insert("username".to_string(), "admin".to_string());

        let renderer = TemplateRenderer::new(templates.path());
        let result = renderer
            .render(&sample_config(), output.path(), &secrets)
            .expect("render");

        let compose = fs::read_to_string(&result.compose_path).unwrap();
        assert!(compose.contains("\"8989:8989\""));
        let env = fs::read_to_string(&result.env_path).unwrap();
        assert_eq!(env.trim(), "PUID=1000");

        let secret_path = result
            .secret_files
            .get("qbittorrent/credentials.env")
            .expect("secret rendered");
        assert_eq!(
            fs::read_to_string(secret_path).unwrap().trim(),
            "QB_USER=admin"
        );
        assert!(result.secrets_dir.unwrap().ends_with(".secrets"));
    }

    #[test]
    fn missing_compose_template_is_a_typed_error() {
        let templates = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        write_template(templates.path(), ENV_TEMPLATE, "TZ=UTC\n");

        let renderer = TemplateRenderer::new(templates.path());
        let err = renderer
            .render(&sample_config(), output.path(), &SecretsSnapshot::new())
            .expect_err("must fail");
        assert!(matches!(err, ComposeError::TemplateNotFound { name } if name == COMPOSE_TEMPLATE));
    }

    #[test]
    fn missing_template_dir_is_a_typed_error() {
        let renderer = TemplateRenderer::new("/nonexistent/templates");
        let err = renderer
            .render(
                &sample_config(),
                Path::new("/tmp/unused-output"),
                &SecretsSnapshot::new(),
            )
            .expect_err("must fail");
        assert!(matches!(err, ComposeError::TemplateNotFound { .. }));
    }

    #[test]
    fn render_secrets_alone_refreshes_files() {
        let templates = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        write_template(templates.path(), COMPOSE_TEMPLATE, "services: {}\n");
        write_template(templates.path(), ENV_TEMPLATE, "TZ=UTC\n");
        write_template(
            templates.path(),
            "secrets/sonarr/api.env.j2",
            "API_KEY={{ secrets.sonarr.api_key }}\n",
        );

        let renderer = TemplateRenderer::new(templates.path());
        let mut secrets = SecretsSnapshot::new();
        secrets
            .entry("sonarr".to_string())
            .or_default()
            .insert("api_key".to_string(), "first".to_string());
        renderer
            .render(&sample_config(), output.path(), &secrets)
            .expect("initial render");

        secrets
            .get_mut("sonarr")
            .unwrap()
            .insert("api_key".to_string(), "second".to_string());
        let (_, files) = renderer
            .render_secrets(&sample_config(), output.path(), &secrets)
            .expect("refresh");
        let content = fs::read_to_string(files.get("sonarr/api.env").unwrap()).unwrap();
        assert_eq!(content.trim(), "API_KEY=second");
    }

    #[test]
    fn derived_downloads_root_prefers_scratch() {
        let templates = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        write_template(
            templates.path(),
            COMPOSE_TEMPLATE,
            "# downloads at {{ derived.downloads_root }}\n",
        );
        write_template(templates.path(), ENV_TEMPLATE, "x=1\n");

        let renderer = TemplateRenderer::new(templates.path());
        let result = renderer
            .render(&sample_config(), output.path(), &SecretsSnapshot::new())
            .expect("render");
        let compose = fs::read_to_string(&result.compose_path).unwrap();
        assert!(compose.contains("/mnt/scratch/downloads"));
    }
}
