use super::Params;
use crate::auth::RegistryCredentials;
use crate::error::{ParamError, Result};
use crate::model::{
    BuildSpec, DEFAULT_CPU_PERIOD, DEFAULT_CPU_QUOTA, DEFAULT_DOCKERFILE, DEFAULT_MEMORY_BYTES,
    MAX_CPU_MILLIS, MAX_MEMORY_BYTES, validate_reference,
};
use std::collections::BTreeMap;

/// 未使用であることを示す値でなければならないパラメータ
const SENTINELS: &[(&str, &str)] = &[
    ("cgroupparent", ""),
    ("cpusetcpus", ""),
    ("cpusetmems", ""),
    ("cpushares", "0"),
    ("memswap", "0"),
    ("shmsize", "0"),
    ("ulimits", "null"),
];

/// クライアントによって未使用値が異なるパラメータ（docker / tilt）
const TWO_CONVENTIONS: &[(&str, &[&str])] = &[
    ("networkmode", &["default", ""]),
    ("version", &["1", "2"]),
    ("rm", &["1", "0"]),
];

/// ビルドリクエストを検証して BuildSpec を生成
pub fn parse_build(params: &Params, registry_config: Option<&str>) -> Result<BuildSpec> {
    check_sentinels(params)?;

    let cache_from = parse_cache_from(params.get("cachefrom"))?;

    let build_args = parse_json_map("buildargs", params.get("buildargs"))?;
    let labels = parse_json_map("labels", params.get("labels"))?;

    // cpu limit
    let cpu_quota = parse_u64("cpuquota", params.get("cpuquota"))?
        .filter(|q| *q > 0)
        .unwrap_or(DEFAULT_CPU_QUOTA);
    let cpu_period = parse_u64("cpuperiod", params.get("cpuperiod"))?
        .filter(|p| *p > 0)
        .unwrap_or(DEFAULT_CPU_PERIOD);
    let cpu_millis = cpu_quota
        .checked_mul(1000)
        .map(|q| (q / cpu_period).max(1))
        .filter(|millis| *millis <= MAX_CPU_MILLIS)
        .ok_or_else(|| {
            ParamError::invalid(
                "cpuquota",
                format!("{}/{} exceeds {} millicores", cpu_quota, cpu_period, MAX_CPU_MILLIS),
            )
        })?;

    // memory limit
    let memory_bytes = parse_u64("memory", params.get("memory"))?
        .filter(|m| *m > 0)
        .unwrap_or(DEFAULT_MEMORY_BYTES);
    if memory_bytes > MAX_MEMORY_BYTES {
        return Err(ParamError::invalid(
            "memory",
            format!("{} exceeds {} bytes", memory_bytes, MAX_MEMORY_BYTES),
        ));
    }

    let dockerfile = params
        .get_non_empty("dockerfile")
        .unwrap_or(DEFAULT_DOCKERFILE)
        .to_string();
    validate_dockerfile(&dockerfile)?;

    let target = params.get_non_empty("target").map(str::to_string);

    let tags: Vec<String> = params.get_all("t").into_iter().map(str::to_string).collect();
    for tag in &tags {
        validate_reference(tag).map_err(|message| ParamError::Invalid { name: "t", message })?;
    }

    let no_cache = matches!(params.get("nocache"), Some("1") | Some("true"));

    let credentials = RegistryCredentials::from_registry_config(registry_config)?;

    Ok(BuildSpec {
        build_args,
        labels,
        dockerfile,
        target,
        tags,
        cpu_millis,
        memory_bytes,
        cache_from,
        no_cache,
        credentials,
    })
}

fn check_sentinels(params: &Params) -> Result<()> {
    // 同じキーの繰り返しもすべて検査する
    for &(name, expected) in SENTINELS {
        if let Some(value) = params.get_all(name).into_iter().find(|v| *v != expected) {
            return Err(ParamError::Unsupported {
                name,
                value: value.to_string(),
            });
        }
    }

    for &(name, accepted) in TWO_CONVENTIONS {
        if let Some(value) = params
            .get_all(name)
            .into_iter()
            .find(|v| !accepted.contains(v))
        {
            return Err(ParamError::Unsupported {
                name,
                value: value.to_string(),
            });
        }
    }

    Ok(())
}

/// cachefrom は JSON 配列で、最大1件まで
fn parse_cache_from(raw: Option<&str>) -> Result<Option<String>> {
    let entries: Vec<String> = match raw {
        None | Some("") | Some("null") => return Ok(None),
        Some(raw) => serde_json::from_str::<Option<Vec<String>>>(raw)
            .map_err(|e| ParamError::invalid("cachefrom", e))?
            .unwrap_or_default(),
    };

    match entries.as_slice() {
        [] => Ok(None),
        [single] => {
            validate_reference(single).map_err(|message| ParamError::Invalid {
                name: "cachefrom",
                message,
            })?;
            Ok(Some(single.clone()))
        }
        _ => Err(ParamError::Unsupported {
            name: "cachefrom",
            value: raw.unwrap_or_default().to_string(),
        }),
    }
}

/// buildargs / labels は JSON オブジェクト。null の値は取り除く
fn parse_json_map(name: &'static str, raw: Option<&str>) -> Result<BTreeMap<String, String>> {
    let raw = match raw {
        None | Some("") => return Ok(BTreeMap::new()),
        Some(raw) => raw,
    };

    let parsed: Option<BTreeMap<String, Option<String>>> =
        serde_json::from_str(raw).map_err(|e| ParamError::invalid(name, e))?;

    Ok(parsed
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k, v)))
        .collect())
}

fn parse_u64(name: &'static str, raw: Option<&str>) -> Result<Option<u64>> {
    match raw {
        None | Some("") => Ok(None),
        Some(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ParamError::invalid(name, format!("'{}': {}", raw, e))),
    }
}

/// Dockerfile はコンテキスト内の相対パスでなければならない
fn validate_dockerfile(path: &str) -> Result<()> {
    if path.starts_with('/') || path.split('/').any(|segment| segment == "..") {
        return Err(ParamError::Unsupported {
            name: "dockerfile",
            value: path.to_string(),
        });
    }
    Ok(())
}
