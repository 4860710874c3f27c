//! Performance analysis with optional model-generated advice.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{json, Value};

use super::guests::not_found;
use super::{node_property, percent, required_str, round2, schema, vmid, vmid_property};
use crate::advisor::{classify, performance_prompt, CRITICAL_THRESHOLD, WARNING_THRESHOLD};
use crate::dispatcher::{GatewayContext, OperationDescriptor};
use crate::error::GatewayError;
use crate::transport::GuestKind;

pub fn operations() -> Vec<OperationDescriptor> {
    vec![OperationDescriptor {
        name: "analyze_vm_performance",
        description: "Assess a VM's current CPU and memory usage (Good/Warning/Critical) and attach tuning advice from the configured model.",
        permission: "vm:monitor",
        input_schema: schema(
            json!({ "node": node_property(), "vmid": vmid_property("VM id.") }),
            &["node", "vmid"],
        ),
        handler: analyze_vm_performance,
    }]
}

/// Usage figures derived from `status/current`.
pub(crate) fn metrics(status: &Value) -> Value {
    json!({
        "status": status["status"],
        "cpu_usage_percent": round2(status["cpu"].as_f64().unwrap_or(0.0) * 100.0),
        "cpus": status["cpus"],
        "memory_usage_percent": percent(&status["mem"], &status["maxmem"]),
        "memory_used": status["mem"],
        "memory_total": status["maxmem"],
        "uptime_hours": round2(status["uptime"].as_f64().unwrap_or(0.0) / 3600.0),
    })
}

/// Rule-based hints that do not depend on the advisor.
pub(crate) fn suggestions(cpu: f64, mem: f64, running: bool) -> Vec<&'static str> {
    let mut out = Vec::new();
    if !running {
        out.push("VM is not running; usage figures reflect a stopped guest");
        return out;
    }
    if mem > CRITICAL_THRESHOLD {
        out.push("Memory is nearly exhausted: add RAM or enable ballooning");
    } else if mem > WARNING_THRESHOLD {
        out.push("Memory usage is high: watch for swapping inside the guest");
    } else if mem < 20.0 {
        out.push("Memory is mostly idle: the allocation could be reduced");
    }
    if cpu > CRITICAL_THRESHOLD {
        out.push("CPU is saturated: add cores or move the VM to a less loaded node");
    } else if cpu > WARNING_THRESHOLD {
        out.push("CPU usage is high: review workloads or add a core");
    }
    out
}

fn analyze_vm_performance<'a>(
    ctx: &'a GatewayContext,
    args: &'a Value,
) -> BoxFuture<'a, Result<Value, GatewayError>> {
    async move {
        let node = required_str(args, "node")?;
        let vmid = vmid(args, "vmid")?;
        let status = ctx
            .client
            .guest_status(node, GuestKind::Qemu, vmid)
            .await
            .map_err(|e| not_found(e, GuestKind::Qemu, vmid))?;

        let metrics = metrics(&status);
        let cpu = metrics["cpu_usage_percent"].as_f64().unwrap_or(0.0);
        let mem = metrics["memory_usage_percent"].as_f64().unwrap_or(0.0);
        let name = status["name"].as_str().unwrap_or("unnamed");

        let advice = ctx
            .advisor
            .complete(&performance_prompt(vmid, name, &metrics))
            .await;

        Ok(json!({
            "vmid": vmid,
            "node": node,
            "name": name,
            "analysis_timestamp": chrono::Utc::now().to_rfc3339(),
            "performance_status": classify(cpu.max(mem)),
            "metrics": metrics,
            "automated_suggestions": suggestions(cpu, mem, status["status"] == "running"),
            "ai_recommendations": advice,
        }))
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::DISABLED_TEXT;
    use crate::dispatcher::tests::dispatcher;
    use crate::mock::MockTransport;

    #[test]
    fn metrics_from_status() {
        let m = metrics(&json!({"status": "running", "cpu": 0.5, "cpus": 2, "mem": 3, "maxmem": 4, "uptime": 7200}));
        assert_eq!(m["cpu_usage_percent"], 50.0);
        assert_eq!(m["memory_usage_percent"], 75.0);
        assert_eq!(m["uptime_hours"], 2.0);
    }

    #[test]
    fn stopped_vm_gets_single_hint() {
        assert_eq!(suggestions(0.0, 0.0, false).len(), 1);
        assert!(suggestions(50.0, 50.0, true).is_empty());
        assert_eq!(suggestions(95.0, 95.0, true).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn worst_metric_sets_status() {
        let mock = MockTransport::new();
        let d = dispatcher(&mock).await;
        mock.respond(
            "guest_status",
            json!({"status": "running", "name": "db", "cpu": 0.1, "mem": 95, "maxmem": 100, "uptime": 60}),
        );

        let env = d
            .call_operation("analyze_vm_performance", &json!({"node": "pve1", "vmid": 101}), "viewer")
            .await;
        let result = env.result.unwrap();
        assert_eq!(result["performance_status"], "Critical");
        assert_eq!(result["name"], "db");
        assert_eq!(result["ai_recommendations"], DISABLED_TEXT);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_vm_is_not_found() {
        let mock = MockTransport::new();
        let d = dispatcher(&mock).await;
        mock.fail("guest_status", 500, "Configuration file 'qemu-server/999.conf' does not exist");

        let env = d
            .call_operation("analyze_vm_performance", &json!({"node": "pve1", "vmid": 999}), "viewer")
            .await;
        assert_eq!(env.error.unwrap().code, "ResourceNotFound");
    }
}
