//! Upgrade path parsing
//!
//! Stations connect to
//! `<base_path>/<tenantID>/<stationIdentity>/<siteAreaID>/<siteID>/<companyID>`.

use thiserror::Error;

/// Number of segments after the base path
const ROUTE_SEGMENTS: usize = 5;

/// Routing context carried by the upgrade path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub tenant_id: String,
    pub station_identity: String,
    pub site_area_id: String,
    pub site_id: String,
    pub company_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("path does not start with {0}")]
    WrongPrefix(String),

    #[error("expected 5 segments after the prefix, got {0}")]
    SegmentCount(usize),

    #[error("empty path segment")]
    EmptySegment,
}

impl Route {
    /// Parse a request path below `base_path`
    pub fn parse(path: &str, base_path: &str) -> Result<Self, RouteError> {
        let mut segments = path
            .trim_start_matches('/')
            .trim_end_matches('/')
            .split('/');

        for expected in base_path.split('/').filter(|s| !s.is_empty()) {
            if segments.next() != Some(expected) {
                return Err(RouteError::WrongPrefix(base_path.to_string()));
            }
        }

        let rest: Vec<&str> = segments.collect();
        if rest.len() != ROUTE_SEGMENTS {
            return Err(RouteError::SegmentCount(rest.len()));
        }
        if rest.iter().any(|s| s.is_empty()) {
            return Err(RouteError::EmptySegment);
        }

        Ok(Self {
            tenant_id: rest[0].to_string(),
            station_identity: rest[1].to_string(),
            site_area_id: rest[2].to_string(),
            site_id: rest[3].to_string(),
            company_id: rest[4].to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_route() {
        let route = Route::parse("/ocpp/tenantA/CS-1/area-1/site-1/company-1", "/ocpp").unwrap();

        assert_eq!(route.tenant_id, "tenantA");
        assert_eq!(route.station_identity, "CS-1");
        assert_eq!(route.site_area_id, "area-1");
        assert_eq!(route.site_id, "site-1");
        assert_eq!(route.company_id, "company-1");
    }

    #[test]
    fn test_nested_base_path_and_trailing_slash() {
        let route = Route::parse("/api/ocpp16/t/s/a/b/c/", "/api/ocpp16/").unwrap();
        assert_eq!(route.station_identity, "s");

        let route = Route::parse("/t/s/a/b/c", "").unwrap();
        assert_eq!(route.tenant_id, "t");
    }

    #[test]
    fn test_rejects_wrong_shape() {
        assert_eq!(
            Route::parse("/other/t/s/a/b/c", "/ocpp"),
            Err(RouteError::WrongPrefix("/ocpp".to_string()))
        );
        assert_eq!(
            Route::parse("/ocpp/tenantA/CS-1", "/ocpp"),
            Err(RouteError::SegmentCount(2))
        );
        assert_eq!(
            Route::parse("/ocpp/t/s/a/b/c/extra", "/ocpp"),
            Err(RouteError::SegmentCount(6))
        );
        assert_eq!(
            Route::parse("/ocpp/t//a/b/c", "/ocpp"),
            Err(RouteError::EmptySegment)
        );
        assert_eq!(Route::parse("/", "/ocpp"), Err(RouteError::WrongPrefix("/ocpp".to_string())));
    }
}
