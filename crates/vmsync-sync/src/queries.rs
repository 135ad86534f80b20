//! SQL text sent to the remote system.

/// Query text the pipeline needs from the remote system. Circuit queries are
/// answered as tabular data sets, planned-unit queries as chunked `FOR JSON PATH`.
pub trait RemoteQueries: Send + Sync {
    fn circuits_sql(&self, status_filter: &[String]) -> String;

    fn planned_units_sql(&self, work_order: &str) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkStudioQueries;

impl RemoteQueries for WorkStudioQueries {
    fn circuits_sql(&self, status_filter: &[String]) -> String {
        let mut sql = String::from(
            "SELECT SS.JOBGUID AS SS_JOBGUID, SS.WO AS SS_WO, SS.EXT AS SS_EXT, \
             SS.TITLE AS WO_TITLE, SS.EDITDATE AS SS_EDITDATE, VEGJOB.REGION AS REGION, \
             VEGJOB.CYCLETYPE AS VEGJOB_CYCLETYPE, VEGJOB.CONTRACTOR AS VEGJOB_CONTRACTOR, \
             VEGJOB.LENGTH AS VEGJOB_LENGTH, VEGJOB.LENGTHCOMP AS VEGJOB_LENGTHCOMP, \
             VEGJOB.PRCENT AS VEGJOB_PRCENT, WSREQ.STATUS AS WSREQ_STATUS \
             FROM SS \
             INNER JOIN VEGJOB ON VEGJOB.JOBGUID = SS.JOBGUID \
             INNER JOIN WSREQ ON WSREQ.JOBGUID = SS.JOBGUID \
             WHERE SS.JOBTYPE = 'Assessment'",
        );
        if !status_filter.is_empty() {
            let statuses = status_filter
                .iter()
                .map(|s| sql_literal(s))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(" AND WSREQ.STATUS IN ({statuses})"));
        }
        sql.push_str(" ORDER BY SS.WO, SS.EXT");
        sql
    }

    fn planned_units_sql(&self, work_order: &str) -> String {
        format!(
            "SELECT VEGUNIT.UNITGUID, VEGUNIT.WO AS SS_WO, VEGUNIT.EXT AS SS_EXT, VEGUNIT.UNIT, \
             UNITS.UNITDESC AS UNIT_DESC, VEGUNIT.PERMSTAT, VEGUNIT.FORESTER, VEGUNIT.STATNAME, \
             VEGUNIT.LENGTHWRK, VEGUNIT.ACRES, VEGUNIT.NUMTREES, VEGUNIT.ASSDDATE, \
             VEGUNIT.PARCELCOMMENTS \
             FROM VEGUNIT \
             LEFT JOIN UNITS ON UNITS.UNIT = VEGUNIT.UNIT \
             WHERE VEGUNIT.WO = {} \
             FOR JSON PATH",
            sql_literal(work_order)
        )
    }
}

/// Quotes a value as a SQL string literal, doubling embedded single quotes.
pub fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_filter_becomes_in_clause() {
        let sql = WorkStudioQueries.circuits_sql(&["ACTIV".into(), "QC".into()]);
        assert!(sql.contains("WSREQ.STATUS IN ('ACTIV', 'QC')"));

        let unfiltered = WorkStudioQueries.circuits_sql(&[]);
        assert!(!unfiltered.contains("STATUS IN"));
    }

    #[test]
    fn work_order_is_escaped() {
        let sql = WorkStudioQueries.planned_units_sql("2026-01'; DROP TABLE SS; --");
        assert!(sql.contains("WHERE VEGUNIT.WO = '2026-01''; DROP TABLE SS; --'"));
        assert!(sql.ends_with("FOR JSON PATH"));
    }
}
