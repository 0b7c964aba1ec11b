use super::Params;
use crate::auth::RegistryCredentials;
use crate::error::{ParamError, Result};
use crate::model::{CopySpec, InspectSpec, InternalRegistry, validate_reference};

/// pull で受け付けないパラメータとエラー文言
const PULL_REJECTED: &[(&str, &str)] = &[
    ("repo", "repo"),
    ("fromSrc", "import from a file"),
    ("message", "message"),
    ("platform", "platform"),
];

/// `POST /images/create` を検証
///
/// 外部イメージを内部レジストリの `images/` 名前空間にコピーする。
pub fn parse_pull(
    params: &Params,
    registry_auth: Option<&str>,
    registry: &InternalRegistry,
) -> Result<CopySpec> {
    for &(name, what) in PULL_REJECTED {
        if params.get_non_empty(name).is_some() {
            return Err(ParamError::NotSupported(what));
        }
    }

    let from_image = params
        .get_non_empty("fromImage")
        .ok_or(ParamError::Missing("image to pull"))?;
    let tag = params
        .get_non_empty("tag")
        .ok_or(ParamError::Missing("tag to pull"))?;

    let source = if tag.starts_with("sha256:") {
        format!("{}@{}", from_image, tag)
    } else {
        format!("{}:{}", from_image, tag)
    };
    validate_reference(&source).map_err(|message| ParamError::Invalid {
        name: "fromImage",
        message,
    })?;

    let credentials = RegistryCredentials::from_registry_auth(registry_auth, from_image)?;

    Ok(CopySpec {
        destination: registry.image_ref(&source),
        source,
        source_tls_verify: true,
        credentials,
    })
}

/// `POST /images/{name}/tag` を検証
///
/// `name` が digest の場合は digests リポジトリから、それ以外は images から複製する。
pub fn parse_tag(name: &str, params: &Params, registry: &InternalRegistry) -> Result<CopySpec> {
    validate_reference(name).map_err(|message| ParamError::Invalid {
        name: "name",
        message,
    })?;

    let repo = params
        .get_non_empty("repo")
        .ok_or(ParamError::Missing("repo"))?;

    let tags = params.get_all("tag");
    if tags.len() > 1 {
        return Err(ParamError::Unsupported {
            name: "tag",
            value: tags.join(","),
        });
    }
    let tag = tags
        .first()
        .copied()
        .filter(|t| !t.is_empty())
        .unwrap_or("latest");

    let target = format!("{}:{}", repo, tag);
    validate_reference(&target).map_err(|message| ParamError::Invalid {
        name: "repo",
        message,
    })?;

    Ok(CopySpec {
        source: registry.source_ref(name),
        destination: registry.image_ref(&target),
        source_tls_verify: false,
        credentials: RegistryCredentials::default(),
    })
}

/// `GET /images/{name}/json` を検証
pub fn parse_inspect(name: &str, registry: &InternalRegistry) -> Result<InspectSpec> {
    validate_reference(name).map_err(|message| ParamError::Invalid {
        name: "name",
        message,
    })?;

    Ok(InspectSpec {
        image: registry.source_ref(name),
    })
}
