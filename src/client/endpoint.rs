use crate::error::TransportError;
use crate::model::SegmentationParams;
use reqwest::Url;

/// Join a base URL and a path with exactly one `/` between them.
pub fn build_endpoint(base: &str, path: &str) -> String {
    let base = base.trim().trim_end_matches('/');
    let path = path.trim().trim_start_matches('/');
    format!("{base}/{path}")
}

/// Parse a joined endpoint.
pub fn endpoint_url(base: &str, path: &str) -> Result<Url, TransportError> {
    let joined = build_endpoint(base, path);
    Url::parse(&joined).map_err(|_| TransportError::Endpoint(joined))
}

/// `/segment` URL carrying every parameter as a query pair.
pub fn segment_url(base: &str, params: &SegmentationParams) -> Result<Url, TransportError> {
    let mut url = endpoint_url(base, "/segment")?;
    {
        let mut q = url.query_pairs_mut();
        q.append_pair("model_type", params.model_family.backend_key())
            .append_pair("diameter", &params.diameter.to_string())
            .append_pair("channels", &params.channels.as_query_value())
            .append_pair("use_gpu", bool_str(params.use_gpu))
            .append_pair("batch_size", &params.batch_size.to_string())
            .append_pair("resample", bool_str(params.resample))
            .append_pair("normalize", bool_str(params.normalization.is_some()))
            .append_pair("flow_threshold", &params.flow_threshold.to_string())
            .append_pair("cellprob_threshold", &params.cellprob_threshold.to_string());
        if let Some(name) = params.model_name.as_deref().map(str::trim) {
            if !name.is_empty() {
                q.append_pair("model_name", name);
            }
        }
        if let Some(norm) = params.normalization {
            q.append_pair("percentile_low", &norm.percentile_low.to_string())
                .append_pair("percentile_high", &norm.percentile_high.to_string())
                .append_pair("tile_norm", &norm.tile_norm.to_string());
        }
    }
    Ok(url)
}

fn bool_str(v: bool) -> &'static str {
    if v {
        "true"
    } else {
        "false"
    }
}
