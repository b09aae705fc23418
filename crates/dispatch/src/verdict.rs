//! Turn a finished job report into a [`Verdict`].

use scanfleet_core::verdict::{EngineVerdict, PostProcessing, Verdict};
use scanfleet_node::capability::CapabilitySnapshot;
use scanfleet_node::messages::JobReport;

/// Build the verdict for a completed job.
///
/// Engine records are attached to the serving node's engine details by
/// normalized name; engines the node did not list get no details.
pub fn build_verdict(
    node: &str,
    data_id: &str,
    report: JobReport,
    capabilities: &CapabilitySnapshot,
    queue_time_ms: u64,
) -> Verdict {
    let engines = report
        .scan_results
        .scan_details
        .into_iter()
        .map(|(engine, detail)| {
            let definition = capabilities.engine(&engine).cloned();
            EngineVerdict::new(
                engine,
                detail.scan_result_i,
                detail.threat_found.as_deref(),
                detail.scan_time,
                definition,
            )
        })
        .collect();

    let post = report.process_info.post_processing;

    Verdict {
        node: node.to_string(),
        data_id: data_id.to_string(),
        engines,
        file_size: report.file_info.file_size,
        queue_time_ms,
        processing_time_ms: report.process_info.processing_time,
        post_processing: PostProcessing {
            actions_ran: post.actions_ran,
            actions_failed: post.actions_failed,
        },
    }
}
