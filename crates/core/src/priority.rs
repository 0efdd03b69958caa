use crate::models::SYSTEM_TEAM_ID;

/// Inputs to a priority computation (§4.4).
#[derive(Debug, Clone)]
pub struct PriorityRequest<'a> {
    pub plan: &'a str,
    pub team_id: Option<&'a str>,
    pub base_priority: i32,
}

impl<'a> PriorityRequest<'a> {
    pub fn new(plan: &'a str) -> Self {
        Self {
            plan,
            team_id: None,
            base_priority: 10,
        }
    }
}

/// Derives a numeric job priority from plan tier and a tenant's current
/// concurrent job count (lower value = scheduled sooner).
///
/// `job_count` is the caller's already-fetched `getTeamJobCount` result;
/// errors fetching it are the caller's responsibility to fold into
/// `req.base_priority` before calling this (see `compute_with_fallback`).
pub fn compute(req: &PriorityRequest, job_count: u64) -> i32 {
    let team_id = req.team_id.unwrap_or(SYSTEM_TEAM_ID);
    if team_id == SYSTEM_TEAM_ID {
        return 1;
    }

    let plan_key = req.plan.replace('-', "").to_lowercase();
    match plan_key.as_str() {
        "free" => {
            if job_count > 10 {
                15
            } else if job_count > 5 {
                12
            } else {
                10
            }
        }
        "starter" | "hobby" => {
            if job_count > 20 {
                12
            } else if job_count > 10 {
                10
            } else {
                8
            }
        }
        "standard" | "standardnew" => {
            if job_count > 30 {
                8
            } else if job_count > 15 {
                6
            } else {
                5
            }
        }
        "scale" | "growth" | "growthdouble" => {
            if job_count > 50 {
                5
            } else if job_count > 25 {
                3
            } else {
                2
            }
        }
        _ => req.base_priority,
    }
}

/// Runs `compute` against a fallible job-count lookup, falling back to
/// `req.base_priority` on any store error (§4.4 step 4) so a transient
/// counter read never blocks job creation.
pub async fn compute_with_fallback<F, Fut>(req: &PriorityRequest<'_>, fetch_job_count: F) -> i32
where
    F: FnOnce(String) -> Fut,
    Fut: std::future::Future<Output = crate::Result<u64>>,
{
    let team_id = req.team_id.unwrap_or(SYSTEM_TEAM_ID).to_string();
    if team_id == SYSTEM_TEAM_ID {
        return 1;
    }
    match fetch_job_count(team_id).await {
        Ok(count) => compute(req, count),
        Err(_) => req.base_priority,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_team_is_always_highest_priority() {
        let req = PriorityRequest {
            plan: "free",
            team_id: Some(SYSTEM_TEAM_ID),
            base_priority: 10,
        };
        assert_eq!(compute(&req, 999), 1);
    }

    #[test]
    fn free_plan_bands_by_job_count() {
        let req = PriorityRequest {
            plan: "free",
            team_id: Some("tenant-a"),
            base_priority: 10,
        };
        assert_eq!(compute(&req, 0), 10);
        assert_eq!(compute(&req, 6), 12);
        assert_eq!(compute(&req, 11), 15);
    }

    #[test]
    fn plan_key_strips_hyphens() {
        let req = PriorityRequest {
            plan: "growth-double",
            team_id: Some("tenant-a"),
            base_priority: 10,
        };
        assert_eq!(compute(&req, 0), 2);
        assert_eq!(compute(&req, 51), 5);
    }

    #[test]
    fn unknown_plan_falls_back_to_base_priority() {
        let req = PriorityRequest {
            plan: "unknown-plan",
            team_id: Some("tenant-a"),
            base_priority: 42,
        };
        assert_eq!(compute(&req, 0), 42);
    }
}
