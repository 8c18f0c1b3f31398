async fn get_timeline(
    Path((batch_id, index)): Path<(String, usize)>,
    State(state): State<AppState>,
) -> Result<Json<Timeline>, HttpApiError> {
    let inner = state.inner.lock().await;
    let timeline = match lookup_finished(&inner, &batch_id)? {
        FinishedBatch::Live(outcome) => outcome
            .result
            .timelines
            .iter()
            .find(|timeline| timeline.index == index)
            .cloned(),
        FinishedBatch::Stored => inner
            .engine
            .load_timeline(&batch_id, index)
            .map_err(HttpApiError::from_persistence)?,
    };

    timeline
        .map(Json)
        .ok_or_else(|| HttpApiError::timeline_not_found(&batch_id, index))
}

#[derive(Debug, Deserialize)]
struct ValidateProfilesRequest {
    profile_a: ShadowVectorProfile,
    #[serde(default)]
    profile_b: Option<ShadowVectorProfile>,
}

#[derive(Debug, Serialize)]
struct ProfileVerdict {
    party: Speaker,
    profile_id: String,
    valid: bool,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct ValidateProfilesResponse {
    schema_version: String,
    valid: bool,
    profiles: Vec<ProfileVerdict>,
    /// Axes a crisis draw would favour; only reported for a valid pair.
    shared_axes: Vec<VulnerabilityAxis>,
}

async fn validate_profiles(
    Json(request): Json<ValidateProfilesRequest>,
) -> Json<ValidateProfilesResponse> {
    let verdict = |party: Speaker, profile: &ShadowVectorProfile| {
        let error = validate_profile(profile, party).err().map(|err| err.to_string());
        ProfileVerdict {
            party,
            profile_id: profile.profile_id.clone(),
            valid: error.is_none(),
            error,
        }
    };

    let mut profiles = vec![verdict(Speaker::AgentA, &request.profile_a)];
    if let Some(profile_b) = request.profile_b.as_ref() {
        profiles.push(verdict(Speaker::AgentB, profile_b));
    }
    let valid = profiles.iter().all(|verdict| verdict.valid);

    let shared_axes = match request.profile_b.as_ref() {
        Some(profile_b) if valid => shared_top_axes(&request.profile_a, profile_b)
            .into_iter()
            .map(|(axis, _)| axis)
            .collect(),
        _ => Vec::new(),
    };

    Json(ValidateProfilesResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        valid,
        profiles,
        shared_axes,
    })
}
