//! `{{.Field}}` argument templates
//!
//! Run and exec arguments may reference policy fields, for example
//! `--name={{.RemoteUser}}-{{.ImageName}}` or `-e HOME={{.Env.HOME}}`.
//! Whitespace inside the braces is ignored. Anything other than a known
//! field reference is an error; text outside placeholders is copied as-is.

use crate::error::TemplateError;
use crate::policy::SessionPolicy;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Render a single template against a policy
pub fn render(template: &str, policy: &SessionPolicy) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut offset = 0;

    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let body_start = start + OPEN.len();
        let end = rest[body_start..]
            .find(CLOSE)
            .ok_or(TemplateError::Unterminated(offset + start))?;

        let body = rest[body_start..body_start + end].trim();
        out.push_str(&resolve(body, policy)?);

        let consumed = body_start + end + CLOSE.len();
        rest = &rest[consumed..];
        offset += consumed;
    }

    out.push_str(rest);
    Ok(out)
}

/// Render every template in order, stopping at the first failure
pub fn render_all(templates: &[String], policy: &SessionPolicy) -> Result<Vec<String>, TemplateError> {
    templates.iter().map(|t| render(t, policy)).collect()
}

fn resolve(body: &str, policy: &SessionPolicy) -> Result<String, TemplateError> {
    let field = body
        .strip_prefix('.')
        .filter(|f| !f.is_empty())
        .ok_or_else(|| TemplateError::Malformed(body.to_string()))?;

    if let Some(name) = field.strip_prefix("Env.") {
        return Ok(policy.env.get(name).unwrap_or_default().to_string());
    }

    let value = match field {
        "ImageName" => policy.image_name.clone(),
        "RemoteUser" => policy.remote_user.clone(),
        "User" => policy.user().unwrap_or_default().to_string(),
        "EntryPoint" => policy.entrypoint().unwrap_or_default().to_string(),
        "AuthenticationMethod" => policy.auth_method.to_string(),
        "AuthenticationAttempts" => policy.auth_attempts.to_string(),
        "AuthenticationComment" => policy.auth_comment.clone(),
        "Allowed" => policy.allowed.to_string(),
        "IsLocal" => policy.is_local.to_string(),
        "UseTTY" => policy.use_tty.to_string(),
        "Command" => bracketed(&policy.command),
        "Keys" => bracketed(&policy.keys),
        "DockerRunArgs" => bracketed(&policy.docker_run_args),
        "DockerExecArgs" => bracketed(&policy.docker_exec_args),
        other => return Err(TemplateError::UnknownField(other.to_string())),
    };

    Ok(value)
}

// Lists render as `[a b c]`
fn bracketed(items: &[String]) -> String {
    format!("[{}]", items.join(" "))
}
